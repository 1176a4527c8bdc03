//! The append-only log.
//!
//! A [`Log`] is one peer's view of a causal DAG of [`Entry`] values. Entries
//! live in an arena keyed by hash and refer to each other only by hash. The
//! log tracks:
//! - the entry index (all known entries)
//! - the head index (entries with no local child)
//! - a parent -> children index, which also remembers children of parents
//!   that are not present so a late parent is never mistaken for a head
//!
//! Mutation goes through `append`, `join`, `trim` and `remove`. Callers that
//! share a log between tasks must serialize these calls.

use crate::blocks::{get_with_timeout, BlockStore};
use crate::clock::{LamportClock, Timestamp};
use crate::encryption::Keystore;
use crate::entry::{Entry, EntryBuilder, EntryEncryption};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::identity::Identity;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Comparator used to order heads, first element first.
pub type SortFn<T> = fn(&Entry<T>, &Entry<T>) -> Ordering;

/// Ascending "last write wins" order: clock, then hash.
pub fn last_write_wins<T>(a: &Entry<T>, b: &Entry<T>) -> Ordering {
    a.clock().cmp(b.clock()).then_with(|| a.hash().cmp(b.hash()))
}

/// Default head order: newest timestamp first, equal timestamps by clock id
/// ascending, then hash.
pub fn newest_first<T>(a: &Entry<T>, b: &Entry<T>) -> Ordering {
    b.clock()
        .timestamp
        .cmp(&a.clock().timestamp)
        .then_with(|| a.clock().id.cmp(&b.clock().id))
        .then_with(|| a.hash().cmp(b.hash()))
}

/// Size bound applied by [`Log::trim`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TrimOptions {
    /// Keep at most this many entries.
    Length(usize),
    /// Keep at most this many stored bytes.
    Bytes(usize),
}

/// Construction options for a [`Log`].
pub struct LogOptions<T> {
    pub id: Option<String>,
    pub keystore: Option<Arc<dyn Keystore>>,
    pub blocks: Option<Arc<dyn BlockStore>>,
    pub trim: Option<TrimOptions>,
    pub sort: Option<SortFn<T>>,
    pub fetch_timeout: Duration,
    /// Recipients applied to every append unless overridden.
    pub encryption: EntryEncryption,
}

impl<T> Default for LogOptions<T> {
    fn default() -> Self {
        LogOptions {
            id: None,
            keystore: None,
            blocks: None,
            trim: None,
            sort: None,
            fetch_timeout: Duration::from_secs(10),
            encryption: EntryEncryption::default(),
        }
    }
}

impl<T> LogOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_keystore(mut self, keystore: Arc<dyn Keystore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    pub fn with_blocks(mut self, blocks: Arc<dyn BlockStore>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn with_trim(mut self, trim: TrimOptions) -> Self {
        self.trim = Some(trim);
        self
    }

    pub fn with_sort(mut self, sort: SortFn<T>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_encryption(mut self, encryption: EntryEncryption) -> Self {
        self.encryption = encryption;
        self
    }
}

/// Options for [`Log::append`].
#[derive(Clone, Debug, Default)]
pub struct AppendOptions {
    /// Parents; defaults to all current heads.
    pub next: Option<Vec<Hash>>,
    pub refs: Vec<Hash>,
    pub gid: Option<String>,
    pub gid_seed: Option<Vec<u8>>,
    pub timestamp: Option<Timestamp>,
    pub encryption: Option<EntryEncryption>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next(mut self, next: Vec<Hash>) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_refs(mut self, refs: Vec<Hash>) -> Self {
        self.refs = refs;
        self
    }

    pub fn with_gid(mut self, gid: impl Into<String>) -> Self {
        self.gid = Some(gid.into());
        self
    }

    pub fn with_gid_seed(mut self, seed: impl Into<Vec<u8>>) -> Self {
        self.gid_seed = Some(seed.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_encryption(mut self, encryption: EntryEncryption) -> Self {
        self.encryption = Some(encryption);
        self
    }
}

/// Outcome of an append.
#[derive(Debug)]
pub struct AppendResult<T> {
    pub entry: Arc<Entry<T>>,
    /// Heads consumed as parents of the new entry.
    pub removed_heads: Vec<Arc<Entry<T>>>,
    /// Entries dropped by the configured trim.
    pub trimmed: Vec<Arc<Entry<T>>>,
    /// Gids that no longer have a head after this append.
    pub shadowed_gids: Vec<String>,
}

/// Where joined entries come from.
pub enum JoinSource<'a, T> {
    /// Another local log. Its own tails are accepted as partial boundary.
    Log(&'a Log<T>),
    /// Decoded entries, usually heads received from a peer.
    Entries(Vec<Entry<T>>),
}

impl<'a, T> From<&'a Log<T>> for JoinSource<'a, T> {
    fn from(log: &'a Log<T>) -> Self {
        JoinSource::Log(log)
    }
}

impl<'a, T> From<Vec<Entry<T>>> for JoinSource<'a, T> {
    fn from(entries: Vec<Entry<T>>) -> Self {
        JoinSource::Entries(entries)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JoinOptions {
    /// Take at most this many new entries, newest first. Missing parents
    /// beyond the bound become tails.
    pub length: Option<usize>,
    /// Accept received entries whose parents cannot be resolved, leaving
    /// them as tails. Implied by `length`.
    pub partial: bool,
}

impl JoinOptions {
    pub fn with_length(length: usize) -> Self {
        JoinOptions {
            length: Some(length),
            partial: true,
        }
    }

    /// Unbounded join that keeps unresolvable parents as a boundary.
    pub fn partial() -> Self {
        JoinOptions {
            length: None,
            partial: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinResult {
    /// New entries, ascending clock order.
    pub added: Vec<Hash>,
    /// Entries refused for failed verification or unresolvable parents.
    pub rejected: Vec<Hash>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RemoveOptions {
    /// Also remove ancestors left without local children.
    pub recursively: bool,
}

#[derive(Debug)]
pub struct RemoveResult<T> {
    pub removed: Vec<Arc<Entry<T>>>,
    /// Entries that were not removed and why.
    pub skipped: Vec<(Hash, String)>,
}

impl<T> Default for RemoveResult<T> {
    fn default() -> Self {
        RemoveResult {
            removed: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Append-only Merkle-DAG log.
pub struct Log<T> {
    id: String,
    identity: Identity,
    options: LogOptions<T>,
    entries: HashMap<Hash, Arc<Entry<T>>>,
    heads: HashSet<Hash>,
    nexts: HashMap<Hash, BTreeSet<Hash>>,
    byte_len: usize,
}

impl<T> Log<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(identity: Identity, options: LogOptions<T>) -> Result<Self> {
        let id = match &options.id {
            Some(id) if id.is_empty() => {
                return Err(Error::InvalidArgument("log id must not be empty".into()));
            }
            Some(id) => id.clone(),
            None => ulid::Ulid::new().to_string(),
        };
        Ok(Log {
            id,
            identity,
            options,
            entries: HashMap::new(),
            heads: HashSet::new(),
            nexts: HashMap::new(),
            byte_len: 0,
        })
    }

    /// Seeds a log from known entries. When `heads` is given it must match the
    /// sinks of the entry set.
    pub fn from_entries(
        identity: Identity,
        options: LogOptions<T>,
        entries: Vec<Entry<T>>,
        heads: Option<Vec<Hash>>,
    ) -> Result<Self> {
        let mut log = Self::new(identity, options)?;
        for entry in entries {
            if !entry.verify() {
                return Err(Error::InvalidArgument(format!(
                    "entry {} failed verification",
                    entry.hash().short()
                )));
            }
            if !log.entries.contains_key(entry.hash()) {
                log.insert(Arc::new(entry));
            }
        }
        if let Some(heads) = heads {
            let given: HashSet<Hash> = heads.into_iter().collect();
            if given != log.heads {
                return Err(Error::InvalidArgument(
                    "heads do not match the sinks of the given entries".into(),
                ));
            }
        }
        Ok(log)
    }

    /// Loads a log from the block store, walking from `heads` newest first.
    pub async fn load(
        identity: Identity,
        options: LogOptions<T>,
        heads: &[Hash],
        length: Option<usize>,
    ) -> Result<Self> {
        let mut log = Self::new(identity, options)?;
        if log.options.blocks.is_none() {
            return Err(Error::InvalidState("loading requires a block store".into()));
        }
        let limit = length.unwrap_or(usize::MAX);
        let mut queue: BinaryHeap<(LamportClock, Hash)> = BinaryHeap::new();
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut pending: HashMap<Hash, Entry<T>> = HashMap::new();

        for hash in heads {
            if seen.insert(*hash) {
                let entry = log.fetch(hash).await?.ok_or(Error::MissingEntry(*hash))?;
                queue.push((entry.clock().clone(), *hash));
                pending.insert(*hash, entry);
            }
        }

        while log.entries.len() < limit {
            let Some((_, hash)) = queue.pop() else { break };
            let Some(entry) = pending.remove(&hash) else { continue };
            if !entry.verify() {
                warn!(log = %log.id, hash = %hash.short(), "Skipping unverifiable entry during load");
                continue;
            }
            for parent in entry.next() {
                if !seen.insert(*parent) {
                    continue;
                }
                match log.fetch(parent).await {
                    Ok(Some(parent_entry)) => {
                        queue.push((parent_entry.clock().clone(), *parent));
                        pending.insert(*parent, parent_entry);
                    }
                    Ok(None) => trace!(hash = %parent.short(), "Parent not in block store, leaving tail"),
                    Err(err) => debug!(hash = %parent.short(), error = %err, "Failed to fetch parent"),
                }
            }
            log.insert(Arc::new(entry));
        }
        debug!(log = %log.id, entries = log.entries.len(), "Loaded log");
        Ok(log)
    }

    fn keystore(&self) -> Option<&dyn Keystore> {
        self.options.keystore.as_deref()
    }

    async fn fetch(&self, hash: &Hash) -> Result<Option<Entry<T>>> {
        let Some(blocks) = &self.options.blocks else {
            return Ok(None);
        };
        let Some(bytes) = get_with_timeout(blocks.as_ref(), hash, self.options.fetch_timeout).await? else {
            return Ok(None);
        };
        Entry::from_bytes_checked(bytes, hash, self.keystore()).await.map(Some)
    }

    async fn persist(&self, entry: &Entry<T>) -> Result<()> {
        if let Some(blocks) = &self.options.blocks {
            let stored = blocks.put(entry.to_bytes().to_vec()).await?;
            if stored != *entry.hash() {
                return Err(Error::HashMismatch {
                    expected: *entry.hash(),
                    actual: stored,
                });
            }
        }
        Ok(())
    }

    /// Appends `data` as a new entry signed by this log's identity.
    pub async fn append(&mut self, data: T, options: AppendOptions) -> Result<AppendResult<T>> {
        let parent_hashes = match options.next {
            Some(next) => next,
            None => self.head_hashes(),
        };
        let mut parents: Vec<Arc<Entry<T>>> = Vec::with_capacity(parent_hashes.len());
        for hash in &parent_hashes {
            if parents.iter().any(|p| p.hash() == hash) {
                continue;
            }
            let parent = match self.entries.get(hash) {
                Some(entry) => entry.clone(),
                None => Arc::new(self.fetch(hash).await?.ok_or(Error::MissingEntry(*hash))?),
            };
            parents.push(parent);
        }

        let mut builder = EntryBuilder::new(data)
            .with_next(parents.iter().map(|p| p.as_ref()).collect())
            .with_refs(options.refs)
            .encrypt(options.encryption.unwrap_or_else(|| self.options.encryption.clone()));
        if let Some(gid) = options.gid {
            builder = builder.with_gid(gid);
        }
        if let Some(seed) = options.gid_seed {
            builder = builder.with_gid_seed(seed);
        }
        if let Some(timestamp) = options.timestamp {
            builder = builder.with_timestamp(timestamp);
        }
        let entry = builder.build(&self.identity, self.keystore()).await?;
        self.persist(&entry).await?;

        let removed_heads: Vec<Arc<Entry<T>>> = parents
            .iter()
            .filter(|p| self.heads.contains(p.hash()))
            .cloned()
            .collect();
        let entry = Arc::new(entry);
        self.insert(entry.clone());

        let mut shadowed_gids: Vec<String> = Vec::new();
        for consumed in &removed_heads {
            let gid = consumed.gid();
            if gid == entry.gid() || shadowed_gids.iter().any(|g| g == gid) {
                continue;
            }
            let still_headed = self
                .heads
                .iter()
                .filter_map(|h| self.entries.get(h))
                .any(|head| head.gid() == gid);
            if !still_headed {
                shadowed_gids.push(gid.to_string());
            }
        }

        let trimmed = match self.options.trim {
            Some(trim) => self.trim(trim),
            None => Vec::new(),
        };
        trace!(log = %self.id, hash = %entry.hash().short(), "Appended entry");
        Ok(AppendResult {
            entry,
            removed_heads,
            trimmed,
            shadowed_gids,
        })
    }

    /// Merges entries from another log or from received heads.
    pub async fn join<'a>(&mut self, source: impl Into<JoinSource<'a, T>>, options: JoinOptions) -> Result<JoinResult>
    where
        T: 'a,
    {
        let mut candidates: HashMap<Hash, Arc<Entry<T>>> = HashMap::new();
        let mut rejected: HashSet<Hash> = HashSet::new();

        let (incoming, partial_ok) = match source.into() {
            JoinSource::Log(other) => {
                let mut decoded = Vec::new();
                for (hash, entry) in &other.entries {
                    if self.entries.contains_key(hash) {
                        continue;
                    }
                    match Entry::from_bytes(entry.to_bytes().to_vec(), self.keystore()).await {
                        Ok(entry) => decoded.push(entry),
                        Err(err) => {
                            trace!(hash = %hash.short(), error = %err, "Cannot open joined entry");
                            rejected.insert(*hash);
                        }
                    }
                }
                (decoded, true)
            }
            JoinSource::Entries(mut entries) => {
                for entry in &mut entries {
                    entry.set_created_locally(false);
                }
                (entries, options.partial || options.length.is_some())
            }
        };

        for entry in incoming {
            let hash = *entry.hash();
            if self.entries.contains_key(&hash) || candidates.contains_key(&hash) {
                continue;
            }
            if !entry.verify() {
                warn!(log = %self.id, hash = %hash.short(), "Dropping entry with invalid signature");
                rejected.insert(hash);
                continue;
            }
            candidates.insert(hash, Arc::new(entry));
        }

        if let Some(length) = options.length {
            if candidates.len() > length {
                let mut ordered: Vec<Arc<Entry<T>>> = candidates.values().cloned().collect();
                ordered.sort_by(|a, b| newest_first(a, b));
                candidates = ordered
                    .into_iter()
                    .take(length)
                    .map(|e| (*e.hash(), e))
                    .collect();
            }
        }

        // Resolve parents, fetching from the block store until the bound is hit.
        let limit = options.length.unwrap_or(usize::MAX);
        let mut unresolved: HashSet<Hash> = HashSet::new();
        let mut pending: VecDeque<Hash> = candidates.keys().copied().collect();
        while let Some(hash) = pending.pop_front() {
            let Some(entry) = candidates.get(&hash).cloned() else { continue };
            for parent in entry.next() {
                if self.entries.contains_key(parent)
                    || candidates.contains_key(parent)
                    || rejected.contains(parent)
                    || unresolved.contains(parent)
                {
                    continue;
                }
                if candidates.len() < limit {
                    match self.fetch(parent).await {
                        Ok(Some(fetched)) if fetched.verify() => {
                            candidates.insert(*parent, Arc::new(fetched));
                            pending.push_back(*parent);
                            continue;
                        }
                        Ok(Some(_)) => {
                            warn!(hash = %parent.short(), "Fetched parent failed verification");
                            rejected.insert(*parent);
                            continue;
                        }
                        Ok(None) => {}
                        Err(Error::AccessDenied) => {
                            trace!(hash = %parent.short(), "Cannot open fetched parent");
                        }
                        Err(err) => debug!(hash = %parent.short(), error = %err, "Failed to fetch parent"),
                    }
                }
                unresolved.insert(*parent);
            }
        }

        // Reject entries whose ancestry cannot be completed, then their descendants.
        loop {
            let newly: Vec<Hash> = candidates
                .values()
                .filter(|e| {
                    e.next().iter().any(|p| {
                        rejected.contains(p) || (!partial_ok && unresolved.contains(p))
                    })
                })
                .map(|e| *e.hash())
                .collect();
            if newly.is_empty() {
                break;
            }
            for hash in newly {
                candidates.remove(&hash);
                rejected.insert(hash);
            }
        }
        if !rejected.is_empty() {
            debug!(log = %self.id, rejected = rejected.len(), "Rejected entries during join");
        }

        let mut accepted: Vec<Arc<Entry<T>>> = candidates.into_values().collect();
        accepted.sort_by(|a, b| last_write_wins(a, b));
        let mut added = Vec::with_capacity(accepted.len());
        for entry in accepted {
            if let Err(err) = self.persist(&entry).await {
                debug!(hash = %entry.hash().short(), error = %err, "Failed to persist joined entry");
            }
            added.push(*entry.hash());
            self.insert(entry);
        }
        if !added.is_empty() {
            debug!(log = %self.id, added = added.len(), heads = self.heads.len(), "Joined entries");
        }

        let mut rejected: Vec<Hash> = rejected.into_iter().collect();
        rejected.sort();
        Ok(JoinResult { added, rejected })
    }
}

impl<T> Log<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total stored bytes of all entries.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn get(&self, hash: &Hash) -> Option<&Arc<Entry<T>>> {
        self.entries.get(hash)
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn set_trim(&mut self, trim: Option<TrimOptions>) {
        self.options.trim = trim;
    }

    pub fn trim_options(&self) -> Option<TrimOptions> {
        self.options.trim
    }

    fn head_order(&self) -> SortFn<T> {
        self.options.sort.unwrap_or(newest_first::<T>)
    }

    /// Current heads in head order.
    pub fn heads(&self) -> Vec<Arc<Entry<T>>> {
        let mut heads: Vec<Arc<Entry<T>>> = self
            .heads
            .iter()
            .filter_map(|h| self.entries.get(h).cloned())
            .collect();
        let order = self.head_order();
        heads.sort_by(|a, b| order(a, b));
        heads
    }

    pub fn head_hashes(&self) -> Vec<Hash> {
        self.heads().iter().map(|e| *e.hash()).collect()
    }

    pub fn is_head(&self, hash: &Hash) -> bool {
        self.heads.contains(hash)
    }

    /// All entries in ascending clock order.
    pub fn values(&self) -> Vec<Arc<Entry<T>>> {
        let mut values: Vec<Arc<Entry<T>>> = self.entries.values().cloned().collect();
        values.sort_by(|a, b| last_write_wins(a, b));
        values
    }

    /// Entries with at least one parent missing locally, in head order.
    pub fn tails(&self) -> Vec<Arc<Entry<T>>> {
        let mut tails: Vec<Arc<Entry<T>>> = self
            .entries
            .values()
            .filter(|e| e.next().iter().any(|p| !self.entries.contains_key(p)))
            .cloned()
            .collect();
        let order = self.head_order();
        tails.sort_by(|a, b| order(a, b));
        tails
    }

    /// Parent hashes referenced by local entries but not present.
    pub fn tail_hashes(&self) -> Vec<Hash> {
        let missing: BTreeSet<Hash> = self
            .entries
            .values()
            .flat_map(|e| e.next().iter())
            .filter(|p| !self.entries.contains_key(p))
            .copied()
            .collect();
        missing.into_iter().collect()
    }

    /// Entries without parents.
    pub fn roots(&self) -> Vec<Arc<Entry<T>>> {
        let mut roots: Vec<Arc<Entry<T>>> = self.entries.values().filter(|e| e.is_root()).cloned().collect();
        roots.sort_by(|a, b| last_write_wins(a, b));
        roots
    }

    /// Local children of `hash`.
    pub fn children(&self, hash: &Hash) -> Vec<Hash> {
        self.nexts
            .get(hash)
            .map(|c| c.iter().filter(|h| self.entries.contains_key(h)).copied().collect())
            .unwrap_or_default()
    }

    /// Heads reachable by walking children from each ref. A ref that is a
    /// head maps to itself.
    pub fn get_nexts_from_refs(&self, refs: &[Hash]) -> Vec<Hash> {
        let mut found: HashSet<Hash> = HashSet::new();
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut stack: Vec<Hash> = refs.iter().filter(|r| self.entries.contains_key(r)).copied().collect();
        while let Some(hash) = stack.pop() {
            if !visited.insert(hash) {
                continue;
            }
            if self.heads.contains(&hash) {
                found.insert(hash);
                continue;
            }
            if let Some(children) = self.nexts.get(&hash) {
                stack.extend(children.iter().copied());
            }
        }
        let order = self.head_order();
        let mut heads: Vec<Arc<Entry<T>>> = found.iter().filter_map(|h| self.entries.get(h).cloned()).collect();
        heads.sort_by(|a, b| order(a, b));
        heads.iter().map(|e| *e.hash()).collect()
    }

    /// Local causal closure of `from` (included), newest first, at most `limit` entries.
    pub fn ancestors(&self, from: &[Hash], limit: usize) -> Vec<Arc<Entry<T>>> {
        let mut queue: BinaryHeap<(LamportClock, Hash)> = BinaryHeap::new();
        let mut seen: HashSet<Hash> = HashSet::new();
        for hash in from {
            if let Some(entry) = self.entries.get(hash) {
                if seen.insert(*hash) {
                    queue.push((entry.clock().clone(), *hash));
                }
            }
        }
        let mut out = Vec::new();
        while out.len() < limit {
            let Some((_, hash)) = queue.pop() else { break };
            let Some(entry) = self.entries.get(&hash) else { continue };
            for parent in entry.next() {
                if let Some(parent_entry) = self.entries.get(parent) {
                    if seen.insert(*parent) {
                        queue.push((parent_entry.clock().clone(), *parent));
                    }
                }
            }
            out.push(entry.clone());
        }
        out
    }

    fn insert(&mut self, entry: Arc<Entry<T>>) {
        let hash = *entry.hash();
        for parent in entry.next() {
            self.nexts.entry(*parent).or_default().insert(hash);
            self.heads.remove(parent);
        }
        let has_children = self
            .nexts
            .get(&hash)
            .map_or(false, |children| children.iter().any(|c| self.entries.contains_key(c)));
        if !has_children {
            self.heads.insert(hash);
        }
        self.byte_len += entry.byte_len();
        self.entries.insert(hash, entry);
    }

    /// Removes one entry from every index. Parents left without local
    /// children become heads again.
    fn detach(&mut self, hash: &Hash) -> Option<Arc<Entry<T>>> {
        let entry = self.entries.remove(hash)?;
        self.heads.remove(hash);
        self.byte_len = self.byte_len.saturating_sub(entry.byte_len());
        for parent in entry.next() {
            let now_childless = match self.nexts.get_mut(parent) {
                Some(children) => {
                    children.remove(hash);
                    children.is_empty()
                }
                None => false,
            };
            if now_childless {
                self.nexts.remove(parent);
                if self.entries.contains_key(parent) {
                    self.heads.insert(*parent);
                }
            }
        }
        Some(entry)
    }

    fn over_bound(&self, trim: TrimOptions) -> bool {
        match trim {
            TrimOptions::Length(n) => self.entries.len() > n,
            TrimOptions::Bytes(n) => self.byte_len > n,
        }
    }

    /// Drops the oldest entries until the bound holds. Only entries without
    /// local parents are eligible at each step, so the removed set is a
    /// causally closed prefix.
    pub fn trim(&mut self, trim: TrimOptions) -> Vec<Arc<Entry<T>>> {
        let mut removed = Vec::new();
        if !self.over_bound(trim) {
            return removed;
        }
        let mut queued: HashSet<Hash> = HashSet::new();
        let mut queue: BinaryHeap<Reverse<(LamportClock, Hash)>> = BinaryHeap::new();
        for entry in self.entries.values() {
            if entry.next().iter().all(|p| !self.entries.contains_key(p)) {
                queued.insert(*entry.hash());
                queue.push(Reverse((entry.clock().clone(), *entry.hash())));
            }
        }
        while self.over_bound(trim) {
            let Some(Reverse((_, hash))) = queue.pop() else { break };
            let Some(entry) = self.detach(&hash) else { continue };
            for child in self.children(&hash) {
                if queued.contains(&child) {
                    continue;
                }
                let Some(child_entry) = self.entries.get(&child) else { continue };
                if child_entry.next().iter().all(|p| !self.entries.contains_key(p)) {
                    queued.insert(child);
                    queue.push(Reverse((child_entry.clock().clone(), child)));
                }
            }
            removed.push(entry);
        }
        if !removed.is_empty() {
            debug!(log = %self.id, removed = removed.len(), remaining = self.entries.len(), "Trimmed log");
        }
        removed
    }

    /// Explicit removal. Entries that still have local children are skipped.
    pub fn remove(&mut self, hashes: &[Hash], options: RemoveOptions) -> RemoveResult<T> {
        let mut result = RemoveResult::default();
        for hash in hashes {
            if !self.entries.contains_key(hash) {
                continue;
            }
            if !self.children(hash).is_empty() {
                result.skipped.push((*hash, "entry has local children".to_string()));
                continue;
            }
            let mut stack = vec![*hash];
            while let Some(current) = stack.pop() {
                let Some(entry) = self.detach(&current) else { continue };
                if options.recursively {
                    for parent in entry.next() {
                        if self.entries.contains_key(parent) && self.children(parent).is_empty() {
                            stack.push(*parent);
                        }
                    }
                }
                result.removed.push(entry);
            }
        }
        if !result.removed.is_empty() {
            debug!(log = %self.id, removed = result.removed.len(), "Removed entries");
        }
        result
    }
}

impl<T> fmt::Debug for Log<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("heads", &self.heads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_log(seed: u8) -> Log<String> {
        Log::new(Identity::from_seed([seed; 32]), LogOptions::new().with_id("X")).unwrap()
    }

    async fn append(log: &mut Log<String>, data: &str) -> Arc<Entry<String>> {
        log.append(data.to_string(), AppendOptions::new()).await.unwrap().entry
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = Log::<String>::new(Identity::from_seed([1; 32]), LogOptions::new().with_id("")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_append_collapses_heads() {
        let mut log = new_log(1);
        let a = append(&mut log, "a").await;
        let b = log
            .append("b".to_string(), AppendOptions::new().with_next(vec![]))
            .await
            .unwrap()
            .entry;
        assert_eq!(log.heads().len(), 2);

        let result = log.append("c".to_string(), AppendOptions::new()).await.unwrap();
        assert_eq!(result.removed_heads.len(), 2);
        assert_eq!(result.entry.next().len(), 2);
        assert!(result.entry.next().contains(a.hash()));
        assert!(result.entry.next().contains(b.hash()));
        assert_eq!(log.head_hashes(), vec![*result.entry.hash()]);
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_append_missing_next_fails() {
        let mut log = new_log(1);
        let missing = Hash::digest(b"nope");
        let err = log
            .append("x".to_string(), AppendOptions::new().with_next(vec![missing]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::MissingEntry(missing));
    }

    #[tokio::test]
    async fn test_shadowed_gid_triangle() {
        let mut log = new_log(1);
        let a = log
            .append("a".to_string(), AppendOptions::new().with_next(vec![]))
            .await
            .unwrap()
            .entry;
        let b = log
            .append("b".to_string(), AppendOptions::new().with_next(vec![]))
            .await
            .unwrap()
            .entry;
        let result = log
            .append("ab".to_string(), AppendOptions::new().with_next(vec![*a.hash(), *b.hash()]))
            .await
            .unwrap();
        let expected = if result.entry.gid() == a.gid() { b.gid() } else { a.gid() };
        assert_eq!(result.shadowed_gids, vec![expected.to_string()]);
    }

    #[tokio::test]
    async fn test_no_shadow_when_gid_still_has_head() {
        let mut log = new_log(1);
        let a0 = log
            .append("a0".to_string(), AppendOptions::new().with_next(vec![]))
            .await
            .unwrap()
            .entry;
        let a1 = log
            .append("a1".to_string(), AppendOptions::new().with_next(vec![*a0.hash()]))
            .await
            .unwrap()
            .entry;
        let b1 = log
            .append("b1".to_string(), AppendOptions::new().with_next(vec![]))
            .await
            .unwrap()
            .entry;
        log.append("b2".to_string(), AppendOptions::new().with_next(vec![*b1.hash()]))
            .await
            .unwrap();
        let result = log
            .append("a2".to_string(), AppendOptions::new().with_next(vec![*a1.hash(), *b1.hash()]))
            .await
            .unwrap();
        assert_eq!(result.entry.gid(), a0.gid());
        assert!(result.shadowed_gids.is_empty());
    }

    #[tokio::test]
    async fn test_trim_removes_oldest_prefix() {
        let mut log = new_log(1);
        let mut hashes = Vec::new();
        for i in 0..5 {
            hashes.push(*append(&mut log, &format!("e{}", i)).await.hash());
        }
        let removed = log.trim(TrimOptions::Length(2));
        let removed: Vec<Hash> = removed.iter().map(|e| *e.hash()).collect();
        assert_eq!(removed, hashes[..3].to_vec());
        assert_eq!(log.len(), 2);
        assert_eq!(log.tails().len(), 1);
        assert_eq!(*log.tails()[0].hash(), hashes[3]);
        assert_eq!(log.tail_hashes(), vec![hashes[2]]);
        assert_eq!(log.head_hashes(), vec![hashes[4]]);
    }

    #[tokio::test]
    async fn test_trim_by_bytes() {
        let mut log = new_log(1);
        for i in 0..4 {
            append(&mut log, &format!("entry-{}", i)).await;
        }
        let budget = log.byte_len() / 2;
        log.trim(TrimOptions::Bytes(budget));
        assert!(log.byte_len() <= budget);
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn test_append_applies_configured_trim() {
        let mut log: Log<String> = Log::new(
            Identity::from_seed([1; 32]),
            LogOptions::new().with_trim(TrimOptions::Length(2)),
        )
        .unwrap();
        append(&mut log, "1").await;
        append(&mut log, "2").await;
        let result = log.append("3".to_string(), AppendOptions::new()).await.unwrap();
        assert_eq!(result.trimmed.len(), 1);
        assert_eq!(result.trimmed[0].payload().unwrap(), "1");
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_head_restores_parent_as_head() {
        let mut log = new_log(1);
        let a = append(&mut log, "a").await;
        let b = append(&mut log, "b").await;

        let result = log.remove(&[*a.hash()], RemoveOptions::default());
        assert!(result.removed.is_empty());
        assert_eq!(result.skipped.len(), 1);

        let result = log.remove(&[*b.hash()], RemoveOptions::default());
        assert_eq!(result.removed.len(), 1);
        assert_eq!(log.head_hashes(), vec![*a.hash()]);
    }

    #[tokio::test]
    async fn test_remove_recursively_keeps_shared_ancestors() {
        let mut log = new_log(1);
        let root = append(&mut log, "root").await;
        let left = log
            .append("left".to_string(), AppendOptions::new().with_next(vec![*root.hash()]))
            .await
            .unwrap()
            .entry;
        let right = log
            .append("right".to_string(), AppendOptions::new().with_next(vec![*root.hash()]))
            .await
            .unwrap()
            .entry;

        let result = log.remove(&[*left.hash()], RemoveOptions { recursively: true });
        assert_eq!(result.removed.len(), 1);
        assert!(log.has(root.hash()));
        assert_eq!(log.head_hashes(), vec![*right.hash()]);

        let result = log.remove(&[*right.hash()], RemoveOptions { recursively: true });
        assert_eq!(result.removed.len(), 2);
        assert!(log.is_empty());
        assert!(log.heads().is_empty());
    }

    #[tokio::test]
    async fn test_get_nexts_from_refs() {
        let mut log = new_log(1);
        let e0 = append(&mut log, "0").await;
        assert_eq!(log.get_nexts_from_refs(&[*e0.hash()]), vec![*e0.hash()]);

        let e1 = append(&mut log, "1").await;
        assert_eq!(log.get_nexts_from_refs(&[*e0.hash()]), vec![*e1.hash()]);

        let e2a = log
            .append("2a".to_string(), AppendOptions::new().with_next(vec![*e1.hash()]))
            .await
            .unwrap()
            .entry;
        let e2b = log
            .append("2b".to_string(), AppendOptions::new().with_next(vec![*e1.hash()]))
            .await
            .unwrap()
            .entry;
        let mut nexts = log.get_nexts_from_refs(&[*e0.hash()]);
        nexts.sort();
        let mut expected = vec![*e2a.hash(), *e2b.hash()];
        expected.sort();
        assert_eq!(nexts, expected);
    }

    #[tokio::test]
    async fn test_refs_overlapping_next_are_dropped() {
        let mut log = new_log(1);
        let e0 = append(&mut log, "0").await;
        let e1 = log
            .append(
                "1".to_string(),
                AppendOptions::new().with_next(vec![*e0.hash()]).with_refs(vec![*e0.hash()]),
            )
            .await
            .unwrap()
            .entry;
        assert!(e1.refs().is_empty());
    }

    #[tokio::test]
    async fn test_ancestors_limit() {
        let mut log = new_log(1);
        for i in 0..6 {
            append(&mut log, &i.to_string()).await;
        }
        let heads = log.head_hashes();
        assert_eq!(log.ancestors(&heads, 3).len(), 3);
        assert_eq!(log.ancestors(&heads, 100).len(), 6);
        assert_eq!(log.ancestors(&heads, 3)[0].hash(), &heads[0]);
    }
}

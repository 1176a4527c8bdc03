//! Persistent key-value cache and the head cache built on it.
//!
//! The head cache is an append-only chain of head sets:
//!
//! ```text
//! <id>/_heads          -> CachePath { path }          (latest link)
//! <path>               -> HeadsCache { heads, last }  (heads added, previous link)
//! <id>/_heads_removed  -> same chain, heads removed
//! ```
//!
//! Live heads are the union of the added chain minus the union of the
//! removed chain. When removals pile up the chain is rewritten as a single
//! snapshot of the live heads.

use crate::error::{Error, Result};
use async_trait::async_trait;
use mdrl_log::Hash;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// Key-value storage for node metadata.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
}

/// In-memory [`Cache`].
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Writes raw bytes, bypassing any encoding.
    pub fn set_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.write().insert(key.to_string(), value);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct CachePath {
    path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct HeadsCache {
    heads: Vec<Hash>,
    last: Option<String>,
}

async fn read_value<V: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<V>> {
    let Some(bytes) = cache.get(key).await? else {
        return Ok(None);
    };
    bincode::deserialize(&bytes).map(Some).map_err(|e| Error::CorruptCache {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

async fn write_value<V: Serialize>(cache: &dyn Cache, key: &str, value: &V) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    cache.set(key, bytes).await
}

/// One chain of head sets rooted at `root`.
struct Chain {
    root: String,
    latest: Option<String>,
    links: Vec<String>,
    hashes: HashSet<Hash>,
}

impl Chain {
    async fn load(cache: &dyn Cache, root: String) -> Result<Self> {
        let mut chain = Chain {
            root,
            latest: None,
            links: Vec::new(),
            hashes: HashSet::new(),
        };
        let Some(pointer) = read_value::<CachePath>(cache, &chain.root).await? else {
            return Ok(chain);
        };
        chain.latest = Some(pointer.path.clone());
        let mut next = Some(pointer.path);
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(path) = next {
            if !visited.insert(path.clone()) {
                return Err(Error::CorruptCache {
                    key: path,
                    reason: "head chain loops".into(),
                });
            }
            let link: HeadsCache = read_value(cache, &path).await?.ok_or_else(|| Error::CorruptCache {
                key: path.clone(),
                reason: "head chain link missing".into(),
            })?;
            chain.hashes.extend(link.heads);
            chain.links.push(path);
            next = link.last;
        }
        Ok(chain)
    }

    async fn push(&mut self, cache: &dyn Cache, heads: Vec<Hash>) -> Result<()> {
        let path = format!("{}/{}", self.root, ulid::Ulid::new());
        self.hashes.extend(heads.iter().copied());
        write_value(
            cache,
            &path,
            &HeadsCache {
                heads,
                last: self.latest.clone(),
            },
        )
        .await?;
        write_value(cache, &self.root, &CachePath { path: path.clone() }).await?;
        self.latest = Some(path.clone());
        self.links.push(path);
        Ok(())
    }

    async fn clear(&mut self, cache: &dyn Cache) -> Result<()> {
        cache.del(&self.root).await?;
        for link in self.links.drain(..) {
            cache.del(&link).await?;
        }
        self.latest = None;
        self.hashes.clear();
        Ok(())
    }
}

/// Persistent record of a store's heads.
pub struct HeadCache {
    added: Chain,
    removed: Chain,
}

impl HeadCache {
    /// Loads the chains of store `id`. Fails with `CorruptCache` on undecodable
    /// or broken chains.
    pub async fn load(cache: &dyn Cache, id: &str) -> Result<Self> {
        let added = Chain::load(cache, format!("{}/_heads", id)).await?;
        let removed = Chain::load(cache, format!("{}/_heads_removed", id)).await?;
        trace!(store = %id, added = added.hashes.len(), removed = removed.hashes.len(), "Loaded head cache");
        Ok(HeadCache { added, removed })
    }

    /// Live heads, sorted by hash.
    pub fn heads(&self) -> Vec<Hash> {
        let live: BTreeSet<Hash> = self
            .added
            .hashes
            .iter()
            .filter(|h| !self.removed.hashes.contains(h))
            .copied()
            .collect();
        live.into_iter().collect()
    }

    pub fn removed_len(&self) -> usize {
        self.removed.hashes.len()
    }

    /// Records a head change. Re-added heads or enough removals rewrite the
    /// chain as one snapshot.
    pub async fn update(&mut self, cache: &dyn Cache, added: &[Hash], removed: &[Hash]) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let readded = added.iter().any(|h| self.removed.hashes.contains(h));
        let removed: Vec<Hash> = removed
            .iter()
            .filter(|h| self.added.hashes.contains(h) && !self.removed.hashes.contains(h))
            .copied()
            .collect();
        let added: Vec<Hash> = added
            .iter()
            .filter(|h| !self.added.hashes.contains(h) || self.removed.hashes.contains(h))
            .copied()
            .collect();

        if readded {
            let mut live: BTreeSet<Hash> = self.heads().into_iter().collect();
            live.extend(added);
            for hash in &removed {
                live.remove(hash);
            }
            return self.reset(cache, live.into_iter().collect()).await;
        }

        if !added.is_empty() {
            self.added.push(cache, added).await?;
        }
        if !removed.is_empty() {
            self.removed.push(cache, removed).await?;
        }
        let live = self.heads().len();
        if !self.removed.hashes.is_empty() && self.removed.hashes.len() >= live {
            debug!(root = %self.added.root, live, removed = self.removed.hashes.len(), "Compacting head cache");
            let heads = self.heads();
            self.reset(cache, heads).await?;
        }
        Ok(())
    }

    /// Replaces both chains with a single snapshot of `heads`.
    pub async fn reset(&mut self, cache: &dyn Cache, heads: Vec<Hash>) -> Result<()> {
        self.added.clear(cache).await?;
        self.removed.clear(cache).await?;
        if !heads.is_empty() {
            self.added.push(cache, heads).await?;
        }
        Ok(())
    }
}

/// Key under which a program's manifest hash lives.
pub fn manifest_key(address: &str) -> String {
    format!("{}/_manifest", address)
}

pub async fn read_manifest(cache: &dyn Cache, address: &str) -> Result<Option<Hash>> {
    read_value(cache, &manifest_key(address)).await
}

pub async fn write_manifest(cache: &dyn Cache, address: &str, manifest: &Hash) -> Result<()> {
    write_value(cache, &manifest_key(address), manifest).await
}

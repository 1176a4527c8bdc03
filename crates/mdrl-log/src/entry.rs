//! Log entries and the entry builder.
//!
//! An entry is an immutable, signed node of the causal DAG. It links to its
//! direct parents through `next` and to older ancestors through `refs`. Each
//! stored field can be sealed independently, so a relay holding only the
//! metadata key can verify and forward an entry without reading its payload.

use crate::clock::{LamportClock, Timestamp};
use crate::encryption::{KeyId, Keystore, MaybeEncrypted};
use crate::error::{Error, Result};
use crate::hash::{Hash, Hasher};
use crate::identity::{Identity, SignatureWithKey};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordering and grouping metadata of an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Group id: the causal sub-history this entry belongs to.
    pub gid: String,
    pub clock: LamportClock,
    /// Length of the longest causal chain ending at this entry (roots are 1).
    pub max_chain_length: u64,
}

/// Wire form of an entry.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct StoredEntry<T> {
    meta: MaybeEncrypted<Meta>,
    payload: MaybeEncrypted<T>,
    next: MaybeEncrypted<Vec<Hash>>,
    refs: Vec<Hash>,
    signature: MaybeEncrypted<SignatureWithKey>,
}

/// Recipients per sealable field. An empty list leaves the field plain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryEncryption {
    pub meta: Vec<KeyId>,
    pub payload: Vec<KeyId>,
    pub next: Vec<KeyId>,
    pub signature: Vec<KeyId>,
}

impl EntryEncryption {
    /// Seal every field for the same recipients.
    pub fn all(recipients: Vec<KeyId>) -> Self {
        EntryEncryption {
            meta: recipients.clone(),
            payload: recipients.clone(),
            next: recipients.clone(),
            signature: recipients,
        }
    }

    /// Seal only the payload.
    pub fn payload(recipients: Vec<KeyId>) -> Self {
        EntryEncryption {
            payload: recipients,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.payload.is_empty() && self.next.is_empty() && self.signature.is_empty()
    }
}

async fn wrap<V>(value: V, recipients: &[KeyId], keystore: Option<&dyn Keystore>) -> Result<MaybeEncrypted<V>>
where
    V: Serialize + DeserializeOwned,
{
    if recipients.is_empty() {
        return MaybeEncrypted::plain(value);
    }
    let keystore = keystore.ok_or_else(|| Error::InvalidArgument("encryption requires a keystore".into()))?;
    MaybeEncrypted::sealed(value, recipients, keystore).await
}

fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))
}

/// Digest covered by the entry signature.
fn signable_digest(meta: &Meta, payload: &crate::encryption::Envelope, next: &[Hash], refs: &[Hash]) -> Result<Hash> {
    Ok(Hasher::hash_parts(&[
        &encode(meta)?,
        &encode(payload)?,
        &encode(&next)?,
        &encode(&refs)?,
    ]))
}

/// Derives the gid of a new entry.
///
/// With parents, the parent with the longest causal chain wins; equal lengths
/// go to the lowest clock id, then the lowest gid. Roots hash a seed.
pub fn derive_gid(parents: &[&Meta], seed: Option<&[u8]>) -> String {
    let winner = parents.iter().max_by(|a, b| {
        a.max_chain_length
            .cmp(&b.max_chain_length)
            .then_with(|| b.clock.id.cmp(&a.clock.id))
            .then_with(|| b.gid.cmp(&a.gid))
    });
    match winner {
        Some(meta) => meta.gid.clone(),
        None => match seed {
            Some(seed) => Hash::digest(seed).to_hex(),
            None => {
                let mut random = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut random);
                Hash::digest(&random).to_hex()
            }
        },
    }
}

/// An immutable, signed log entry.
///
/// Metadata, parents and signature are always decoded; the payload is decoded
/// lazily and may stay sealed.
pub struct Entry<T> {
    hash: Hash,
    meta: Meta,
    next: Vec<Hash>,
    refs: Vec<Hash>,
    signature: SignatureWithKey,
    payload: MaybeEncrypted<T>,
    bytes: Vec<u8>,
    created_locally: bool,
}

impl<T> Entry<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Decodes an entry from its stored bytes, opening sealed metadata,
    /// parents and signature with `keystore`. The payload is left as is.
    pub async fn from_bytes(bytes: Vec<u8>, keystore: Option<&dyn Keystore>) -> Result<Self> {
        let stored: StoredEntry<T> = bincode::deserialize(&bytes)?;
        let meta = stored.meta.decrypt(keystore).await?.clone();
        let next = stored.next.decrypt(keystore).await?.clone();
        let signature = stored.signature.decrypt(keystore).await?.clone();
        Ok(Entry {
            hash: Hash::digest(&bytes),
            meta,
            next,
            refs: stored.refs,
            signature,
            payload: stored.payload,
            bytes,
            created_locally: false,
        })
    }

    /// Like [`from_bytes`](Self::from_bytes) but fails if the bytes do not hash to `expected`.
    pub async fn from_bytes_checked(bytes: Vec<u8>, expected: &Hash, keystore: Option<&dyn Keystore>) -> Result<Self> {
        let actual = Hash::digest(&bytes);
        if actual != *expected {
            return Err(Error::HashMismatch {
                expected: *expected,
                actual,
            });
        }
        Self::from_bytes(bytes, keystore).await
    }

    /// Checks the signature against the embedded public key.
    pub fn verify(&self) -> bool {
        match signable_digest(&self.meta, self.payload.envelope(), &self.next, &self.refs) {
            Ok(digest) => self.signature.verify(digest.as_bytes()),
            Err(_) => false,
        }
    }

    /// Payload, if it is plain or was already decrypted.
    pub fn payload(&self) -> Result<&T> {
        self.payload.try_get()
    }

    /// Payload, opening it with `keystore` if sealed. Cached afterwards.
    pub async fn decrypt_payload(&self, keystore: Option<&dyn Keystore>) -> Result<&T> {
        self.payload.decrypt(keystore).await
    }
}

impl<T> Entry<T> {
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn gid(&self) -> &str {
        &self.meta.gid
    }

    pub fn clock(&self) -> &LamportClock {
        &self.meta.clock
    }

    pub fn max_chain_length(&self) -> u64 {
        self.meta.max_chain_length
    }

    pub fn next(&self) -> &[Hash] {
        &self.next
    }

    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }

    pub fn signature(&self) -> &SignatureWithKey {
        &self.signature
    }

    pub fn is_payload_sealed(&self) -> bool {
        self.payload.is_sealed()
    }

    /// Stored bytes; hashing them reproduces [`hash`](Self::hash).
    pub fn to_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn created_locally(&self) -> bool {
        self.created_locally
    }

    pub(crate) fn set_created_locally(&mut self, value: bool) {
        self.created_locally = value;
    }

    pub fn is_root(&self) -> bool {
        self.next.is_empty()
    }

    /// True iff `maybe_parent` is a direct parent of `entry`.
    pub fn is_parent<U>(maybe_parent: &Entry<U>, entry: &Entry<T>) -> bool {
        entry.next.contains(&maybe_parent.hash)
    }
}

impl<T: Clone> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Entry {
            hash: self.hash,
            meta: self.meta.clone(),
            next: self.next.clone(),
            refs: self.refs.clone(),
            signature: self.signature.clone(),
            payload: self.payload.clone(),
            bytes: self.bytes.clone(),
            created_locally: self.created_locally,
        }
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl<T> Eq for Entry<T> {}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("hash", &self.hash)
            .field("gid", &self.meta.gid.get(..8).unwrap_or(self.meta.gid.as_str()))
            .field("clock", &self.meta.clock.timestamp)
            .field("next", &self.next)
            .finish()
    }
}

/// Builder for new entries.
pub struct EntryBuilder<'a, T> {
    data: T,
    next: Vec<&'a Entry<T>>,
    refs: Vec<Hash>,
    gid: Option<String>,
    gid_seed: Option<Vec<u8>>,
    clock: Option<LamportClock>,
    timestamp: Option<Timestamp>,
    encryption: EntryEncryption,
}

impl<'a, T> EntryBuilder<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(data: T) -> Self {
        EntryBuilder {
            data,
            next: Vec::new(),
            refs: Vec::new(),
            gid: None,
            gid_seed: None,
            clock: None,
            timestamp: None,
            encryption: EntryEncryption::default(),
        }
    }

    /// Direct parents. Duplicates are dropped, order is kept.
    pub fn with_next(mut self, next: Vec<&'a Entry<T>>) -> Self {
        self.next = next;
        self
    }

    /// Extra ancestors. Hashes already in `next` are dropped.
    pub fn with_refs(mut self, refs: Vec<Hash>) -> Self {
        self.refs = refs;
        self
    }

    /// Use this gid instead of deriving one.
    pub fn with_gid(mut self, gid: impl Into<String>) -> Self {
        self.gid = Some(gid.into());
        self
    }

    /// Seed for the gid of a root entry.
    pub fn with_gid_seed(mut self, seed: impl Into<Vec<u8>>) -> Self {
        self.gid_seed = Some(seed.into());
        self
    }

    pub fn with_clock(mut self, clock: LamportClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Pin the timestamp of the new clock.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn encrypt(mut self, encryption: EntryEncryption) -> Self {
        self.encryption = encryption;
        self
    }

    pub async fn build(self, identity: &Identity, keystore: Option<&dyn Keystore>) -> Result<Entry<T>> {
        if self.gid.is_some() && self.gid_seed.is_some() {
            return Err(Error::InvalidArgument("gid and gid seed are mutually exclusive".into()));
        }
        if !self.encryption.is_empty() && keystore.is_none() {
            return Err(Error::InvalidArgument("encryption requires a keystore".into()));
        }

        let mut next: Vec<Hash> = Vec::with_capacity(self.next.len());
        let mut parents: Vec<&Meta> = Vec::with_capacity(self.next.len());
        for parent in &self.next {
            if !next.contains(&parent.hash) {
                next.push(parent.hash);
                parents.push(&parent.meta);
            }
        }
        let mut refs: Vec<Hash> = Vec::with_capacity(self.refs.len());
        for r in self.refs {
            if !next.contains(&r) && !refs.contains(&r) {
                refs.push(r);
            }
        }

        let public_key = identity.public_key();
        let clock = match (self.clock, self.timestamp) {
            (Some(clock), _) => clock,
            (None, Some(timestamp)) => LamportClock::with_timestamp(public_key, timestamp),
            (None, None) => match parents.iter().map(|p| &p.clock).max() {
                Some(latest) => LamportClock::new(public_key).advance(latest),
                None => LamportClock::new(public_key),
            },
        };
        let gid = match self.gid {
            Some(gid) => gid,
            None => derive_gid(&parents, self.gid_seed.as_deref()),
        };
        let max_chain_length = parents.iter().map(|p| p.max_chain_length).max().unwrap_or(0) + 1;
        let meta = Meta {
            gid,
            clock,
            max_chain_length,
        };

        let payload = wrap(self.data, &self.encryption.payload, keystore).await?;
        let digest = signable_digest(&meta, payload.envelope(), &next, &refs)?;
        let signature = identity.sign(digest.as_bytes());

        let stored = StoredEntry {
            meta: wrap(meta.clone(), &self.encryption.meta, keystore).await?,
            payload,
            next: wrap(next.clone(), &self.encryption.next, keystore).await?,
            refs: refs.clone(),
            signature: wrap(signature.clone(), &self.encryption.signature, keystore).await?,
        };
        let bytes = encode(&stored)?;

        Ok(Entry {
            hash: Hash::digest(&bytes),
            meta,
            next,
            refs,
            signature,
            payload: stored.payload,
            bytes,
            created_locally: true,
        })
    }
}

//! Content-addressed block storage.

use crate::error::{Error, Result};
use crate::hash::Hash;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Trait for content-addressed storage of opaque blobs.
///
/// Blocks are addressed by the SHA-256 digest of their bytes, the same digest
/// that identifies entries, so an entry can be fetched by its hash.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store `bytes`, returning their address.
    async fn put(&self, bytes: Vec<u8>) -> Result<Hash>;

    /// Fetch a block. `Ok(None)` means the block is unknown.
    async fn get(&self, hash: &Hash, timeout: Option<Duration>) -> Result<Option<Vec<u8>>>;

    async fn has(&self, hash: &Hash) -> Result<bool>;

    /// Drop a block. Removing an unknown block is not an error.
    async fn rm(&self, hash: &Hash) -> Result<()>;
}

/// In-memory block store.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<Hash> {
        let hash = Hash::digest(&bytes);
        self.blocks.write().entry(hash).or_insert(bytes);
        Ok(hash)
    }

    async fn get(&self, hash: &Hash, _timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    async fn has(&self, hash: &Hash) -> Result<bool> {
        Ok(self.blocks.read().contains_key(hash))
    }

    async fn rm(&self, hash: &Hash) -> Result<()> {
        self.blocks.write().remove(hash);
        Ok(())
    }
}

/// Fetch with a deadline applied on top of the store's own handling.
pub async fn get_with_timeout(store: &dyn BlockStore, hash: &Hash, timeout: Duration) -> Result<Option<Vec<u8>>> {
    match tokio::time::timeout(timeout, store.get(hash, Some(timeout))).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(*hash)),
    }
}

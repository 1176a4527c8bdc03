//! A log plus its persisted head cache.

use crate::cache::{Cache, HeadCache};
use crate::error::Result;
use mdrl_log::{
    AppendOptions, AppendResult, Entry, Hash, Identity, JoinOptions, JoinResult, JoinSource, Log, LogOptions,
    RemoveOptions, RemoveResult,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct StoreState<T> {
    log: Log<T>,
    heads: HeadCache,
}

/// One replicated log of a program. Every mutation runs under the store lock
/// and keeps the head cache in step with the log.
pub struct Store<T> {
    index: u32,
    id: String,
    cache: Arc<dyn Cache>,
    state: Mutex<StoreState<T>>,
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens store `id`, restoring its heads from the cache and its entries
    /// from the log's block store.
    pub async fn open(
        index: u32,
        id: String,
        identity: Identity,
        options: LogOptions<T>,
        cache: Arc<dyn Cache>,
    ) -> Result<Self> {
        let heads = HeadCache::load(cache.as_ref(), &id).await?;
        let cached = heads.heads();
        let options = options.with_id(id.clone());
        let log = if cached.is_empty() || options.blocks.is_none() {
            Log::new(identity, options)?
        } else {
            let log = Log::load(identity, options, &cached, None).await?;
            info!(store = %id, entries = log.len(), heads = cached.len(), "Restored store");
            log
        };
        Ok(Store {
            index,
            id,
            cache,
            state: Mutex::new(StoreState { log, heads }),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn append(&self, data: T, options: AppendOptions) -> Result<AppendResult<T>> {
        let mut state = self.state.lock().await;
        let before = head_set(&state.log);
        let result = state.log.append(data, options).await?;
        self.record(&mut state, before).await?;
        Ok(result)
    }

    /// Joins entries received from a peer. Missing ancestors are fetched
    /// from the block store; those it cannot supply become tails.
    pub async fn sync(&self, entries: Vec<Entry<T>>) -> Result<JoinResult> {
        if entries.is_empty() {
            return Ok(JoinResult::default());
        }
        let mut state = self.state.lock().await;
        let before = head_set(&state.log);
        let result = state
            .log
            .join(JoinSource::Entries(entries), JoinOptions::partial())
            .await?;
        self.record(&mut state, before).await?;
        if !result.added.is_empty() {
            debug!(store = %self.id, added = result.added.len(), "Synced entries");
        }
        Ok(result)
    }

    pub async fn remove(&self, hashes: &[Hash], options: RemoveOptions) -> Result<RemoveResult<T>> {
        let mut state = self.state.lock().await;
        let before = head_set(&state.log);
        let result = state.log.remove(hashes, options);
        self.record(&mut state, before).await?;
        Ok(result)
    }

    /// Applies the log's configured trim, if any.
    pub async fn trim(&self) -> Result<Vec<Arc<Entry<T>>>> {
        let mut state = self.state.lock().await;
        let Some(trim) = state.log.trim_options() else {
            return Ok(Vec::new());
        };
        let before = head_set(&state.log);
        let removed = state.log.trim(trim);
        self.record(&mut state, before).await?;
        Ok(removed)
    }

    /// Runs `f` against the log under the store lock.
    pub async fn read<R>(&self, f: impl FnOnce(&Log<T>) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.log)
    }

    pub async fn has(&self, hash: &Hash) -> bool {
        self.read(|log| log.has(hash)).await
    }

    pub async fn len(&self) -> usize {
        self.read(|log| log.len()).await
    }

    pub async fn heads(&self) -> Vec<Arc<Entry<T>>> {
        self.read(|log| log.heads()).await
    }

    pub async fn values(&self) -> Vec<Arc<Entry<T>>> {
        self.read(|log| log.values()).await
    }

    /// Heads as recorded in the cache.
    pub async fn cached_heads(&self) -> Vec<Hash> {
        self.state.lock().await.heads.heads()
    }

    async fn record(&self, state: &mut StoreState<T>, before: HashSet<Hash>) -> Result<()> {
        let after = head_set(&state.log);
        let added: Vec<Hash> = after.difference(&before).copied().collect();
        let removed: Vec<Hash> = before.difference(&after).copied().collect();
        state.heads.update(self.cache.as_ref(), &added, &removed).await
    }
}

fn head_set<T>(log: &Log<T>) -> HashSet<Hash> {
    log.head_hashes().into_iter().collect()
}

//! Programs: a named set of stores replicated under one address.

use crate::config::SyncFilter;
use crate::error::{Error, Result};
use crate::leaders::TrustFilter;
use crate::reorg::{HeadInfo, StoreHeads};
use crate::store::Store;
use async_trait::async_trait;
use mdrl_log::{AppendOptions, AppendResult, Entry, Hash, JoinResult, Keystore, PublicSignKey, RemoveOptions, Timestamp};
use mdrl_net::{HeadWithRefs, SubscriptionRole};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Summary of an entry without its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub hash: Hash,
    pub gid: String,
    pub timestamp: Timestamp,
    pub created_locally: bool,
    pub signer: PublicSignKey,
}

impl EntryInfo {
    fn of<T>(entry: &Entry<T>) -> Self {
        EntryInfo {
            hash: *entry.hash(),
            gid: entry.gid().to_string(),
            timestamp: entry.clock().timestamp,
            created_locally: entry.created_locally(),
            signer: entry.signature().public_key,
        }
    }
}

/// Receives local writes so their heads can be pushed to the gid's leaders.
#[async_trait]
pub(crate) trait WriteHook: Send + Sync {
    async fn on_write(&self, address: &str, store_index: u32, head: Hash, gid: String);
}

/// Payload-independent view of a program used by the node.
#[async_trait]
pub(crate) trait ReplicatedProgram: Send + Sync {
    fn address(&self) -> &str;
    fn role(&self) -> SubscriptionRole;
    fn min_replicas(&self) -> usize;
    fn trust(&self) -> Option<Arc<dyn TrustFilter>>;
    fn store_count(&self) -> u32;

    /// Heads of one store grouped by gid.
    async fn heads_by_gid(&self, store_index: u32) -> Result<StoreHeads>;

    /// Encodes `heads` with up to `max_references` ancestors each.
    async fn exchange_heads(&self, store_index: u32, heads: &[Hash], max_references: usize)
        -> Result<Vec<HeadWithRefs>>;

    /// Decodes received heads, keeps the ones this node should hold and joins them.
    async fn receive_heads(
        &self,
        store_index: u32,
        heads: Vec<HeadWithRefs>,
        is_leader: &(dyn for<'s> Fn(&'s str) -> bool + Send + Sync),
    ) -> Result<JoinResult>;

    async fn remove_recursively(&self, store_index: u32, heads: &[Hash]) -> Result<usize>;

    async fn trim(&self, store_index: u32) -> Result<usize>;
}

/// An opened program. Obtained from [`Node::open`](crate::Node::open).
pub struct Program<T> {
    address: String,
    role: SubscriptionRole,
    min_replicas: usize,
    sync: Option<SyncFilter<T>>,
    trust: Option<Arc<dyn TrustFilter>>,
    keystore: Arc<dyn Keystore>,
    stores: Vec<Store<T>>,
    hook: Weak<dyn WriteHook>,
}

impl<T> Program<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: String,
        role: SubscriptionRole,
        min_replicas: usize,
        sync: Option<SyncFilter<T>>,
        trust: Option<Arc<dyn TrustFilter>>,
        keystore: Arc<dyn Keystore>,
        stores: Vec<Store<T>>,
        hook: Weak<dyn WriteHook>,
    ) -> Self {
        Program {
            address,
            role,
            min_replicas,
            sync,
            trust,
            keystore,
            stores,
            hook,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> SubscriptionRole {
        self.role
    }

    pub fn min_replicas(&self) -> usize {
        self.min_replicas
    }

    pub fn stores(&self) -> &[Store<T>] {
        &self.stores
    }

    pub fn store(&self, index: u32) -> Result<&Store<T>> {
        self.stores
            .get(index as usize)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", self.address, index)))
    }

    /// Appends to a store and pushes the new head to the gid's leaders.
    pub async fn append(&self, store_index: u32, data: T, options: AppendOptions) -> Result<AppendResult<T>> {
        let result = self.store(store_index)?.append(data, options).await?;
        if let Some(hook) = self.hook.upgrade() {
            hook.on_write(
                &self.address,
                store_index,
                *result.entry.hash(),
                result.entry.gid().to_string(),
            )
            .await;
        }
        Ok(result)
    }

    /// Heads of a store grouped by gid.
    pub async fn heads_by_gid_info(&self, store_index: u32) -> Result<BTreeMap<String, Vec<EntryInfo>>> {
        let heads = self.store(store_index)?.heads().await;
        let mut groups: BTreeMap<String, Vec<EntryInfo>> = BTreeMap::new();
        for head in &heads {
            groups.entry(head.gid().to_string()).or_default().push(EntryInfo::of(head));
        }
        Ok(groups)
    }

    fn retained(&self, entry: &Entry<T>) -> bool {
        self.sync.as_ref().map_or(false, |keep| keep(entry))
    }

    async fn decode(&self, bytes: Vec<u8>) -> Option<Entry<T>> {
        match Entry::from_bytes(bytes, Some(self.keystore.as_ref())).await {
            Ok(entry) => Some(entry),
            Err(mdrl_log::Error::AccessDenied) => {
                trace!(address = %self.address, "Skipping entry sealed for other keys");
                None
            }
            Err(err) => {
                debug!(address = %self.address, error = %err, "Skipping undecodable entry");
                None
            }
        }
    }
}

#[async_trait]
impl<T> ReplicatedProgram for Program<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn address(&self) -> &str {
        &self.address
    }

    fn role(&self) -> SubscriptionRole {
        self.role
    }

    fn min_replicas(&self) -> usize {
        self.min_replicas
    }

    fn trust(&self) -> Option<Arc<dyn TrustFilter>> {
        self.trust.clone()
    }

    fn store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    async fn heads_by_gid(&self, store_index: u32) -> Result<StoreHeads> {
        let heads = self.store(store_index)?.heads().await;
        let mut groups: BTreeMap<String, Vec<HeadInfo>> = BTreeMap::new();
        for head in &heads {
            groups.entry(head.gid().to_string()).or_default().push(HeadInfo {
                hash: *head.hash(),
                created_locally: head.created_locally(),
                retained: self.retained(head),
            });
        }
        Ok(StoreHeads { store_index, groups })
    }

    async fn exchange_heads(
        &self,
        store_index: u32,
        heads: &[Hash],
        max_references: usize,
    ) -> Result<Vec<HeadWithRefs>> {
        let store = self.store(store_index)?;
        let encoded: Vec<HeadWithRefs> = store
            .read(|log| {
                heads
                    .iter()
                    .filter_map(|hash| log.get(hash))
                    .map(|head| HeadWithRefs {
                        entry: head.to_bytes().to_vec(),
                        references: log
                            .ancestors(head.next(), max_references)
                            .iter()
                            .map(|e| e.to_bytes().to_vec())
                            .collect(),
                    })
                    .collect()
            })
            .await;
        Ok(encoded)
    }

    async fn receive_heads(
        &self,
        store_index: u32,
        heads: Vec<HeadWithRefs>,
        is_leader: &(dyn for<'s> Fn(&'s str) -> bool + Send + Sync),
    ) -> Result<JoinResult> {
        let store = self.store(store_index)?;
        let mut accepted: Vec<Entry<T>> = Vec::new();
        for head in heads {
            let Some(entry) = self.decode(head.entry).await else { continue };
            if store.has(entry.hash()).await {
                continue;
            }
            let gid = entry.gid().to_string();
            let keep = match &self.sync {
                Some(keep) => keep(&entry),
                None => is_leader(&gid),
            };
            if !keep {
                debug!(address = %self.address, gid = %gid, "Dropping heads, not a leader");
                continue;
            }
            accepted.push(entry);
            for reference in head.references {
                if let Some(entry) = self.decode(reference).await {
                    accepted.push(entry);
                }
            }
        }
        let result = store.sync(accepted).await?;
        if !result.rejected.is_empty() {
            warn!(address = %self.address, rejected = result.rejected.len(), "Rejected received entries");
        }
        Ok(result)
    }

    async fn remove_recursively(&self, store_index: u32, heads: &[Hash]) -> Result<usize> {
        let result = self
            .store(store_index)?
            .remove(heads, RemoveOptions { recursively: true })
            .await?;
        Ok(result.removed.len())
    }

    async fn trim(&self, store_index: u32) -> Result<usize> {
        Ok(self.store(store_index)?.trim().await?.len())
    }
}

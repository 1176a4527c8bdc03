//! The replicating node.
//!
//! A [`Node`] owns the transport, the open programs and the replicator set
//! of every program topic. Transport events are handled in spawned tasks,
//! bounded by `max_concurrent_messages`. Membership changes trigger a
//! replication reorganization of the affected programs.

use crate::cache::{read_manifest, write_manifest, Cache, MemoryCache};
use crate::config::{NodeConfig, OpenOptions};
use crate::error::{Error, Result};
use crate::leaders::{find_leaders, ReplicatorSet};
use crate::program::{Program, ReplicatedProgram, WriteHook};
use crate::reorg;
use crate::store::Store;
use async_trait::async_trait;
use futures::future::join_all;
use mdrl_log::{BlockStore, Hash, Identity, Keystore, LogOptions, MemoryBlockStore, MemoryKeystore};
use mdrl_net::{
    decode_message, encode_message, ExchangeHeadsMessage, ExchangeSwarmMessage, NetworkError, PeerInfo, PubSub,
    PubSubEvent, PublishTarget, Routes, SubscriptionRole, TransportMessage,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Leaders of each gid as of the last reorganization pass.
type GidHistory = HashMap<String, BTreeSet<String>>;

struct OpenedProgram {
    erased: Arc<dyn ReplicatedProgram>,
    typed: Arc<dyn Any + Send + Sync>,
    /// Held for a whole reorganization pass of the program.
    history: Arc<tokio::sync::Mutex<GidHistory>>,
}

struct NodeInner {
    identity: Identity,
    config: NodeConfig,
    pubsub: Arc<dyn PubSub>,
    blocks: Arc<dyn BlockStore>,
    cache: Arc<dyn Cache>,
    keystore: Arc<dyn Keystore>,
    routes: Mutex<Routes>,
    programs: RwLock<HashMap<String, OpenedProgram>>,
    /// Replicators per topic, tracked for every topic seen on the transport.
    replicators: RwLock<HashMap<String, ReplicatorSet>>,
    open_lock: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    pubsub: Arc<dyn PubSub>,
    identity: Option<Identity>,
    config: NodeConfig,
    blocks: Option<Arc<dyn BlockStore>>,
    cache: Option<Arc<dyn Cache>>,
    keystore: Option<Arc<dyn Keystore>>,
}

impl NodeBuilder {
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            pubsub,
            identity: None,
            config: NodeConfig::default(),
            blocks: None,
            cache: None,
            keystore: None,
        }
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn blocks(mut self, blocks: Arc<dyn BlockStore>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn keystore(mut self, keystore: Arc<dyn Keystore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    /// Builds the node and starts its event loop. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Node> {
        let events = self
            .pubsub
            .events()
            .ok_or_else(|| Error::InvalidArgument("transport events are already taken".into()))?;
        if self.config.max_concurrent_messages == 0 {
            return Err(Error::Config("max_concurrent_messages must be positive".into()));
        }
        let me = self.pubsub.local_id().to_string();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_messages));
        let inner = Arc::new(NodeInner {
            identity: self.identity.unwrap_or_else(Identity::generate),
            config: self.config,
            pubsub: self.pubsub,
            blocks: self.blocks.unwrap_or_else(|| Arc::new(MemoryBlockStore::new())),
            cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
            keystore: self.keystore.unwrap_or_else(|| Arc::new(MemoryKeystore::new())),
            routes: Mutex::new(Routes::new(me.clone())),
            programs: RwLock::new(HashMap::new()),
            replicators: RwLock::new(HashMap::new()),
            open_lock: tokio::sync::Mutex::new(()),
            stopping: AtomicBool::new(false),
            shutdown,
            event_task: Mutex::new(None),
        });
        let task = tokio::spawn(run_events(Arc::downgrade(&inner), events, shutdown_rx, permits));
        *inner.event_task.lock() = Some(task);
        info!(peer = %me, "Node started");
        Ok(Node { inner })
    }
}

/// A peer of the replicated database.
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder(pubsub: Arc<dyn PubSub>) -> NodeBuilder {
        NodeBuilder::new(pubsub)
    }

    /// Transport id of this node.
    pub fn peer_id(&self) -> &str {
        self.inner.pubsub.local_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Snapshot of the link graph.
    pub fn routes(&self) -> Routes {
        self.inner.routes.lock().clone()
    }

    /// Opens the program at `address`, or returns it if already open.
    ///
    /// Opening subscribes to the program topic with the role as subscription
    /// data and runs one reorganization pass.
    pub async fn open<T>(&self, address: &str, options: OpenOptions<T>) -> Result<Arc<Program<T>>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.inner.ensure_running()?;
        if address.is_empty() {
            return Err(Error::InvalidArgument("program address is empty".into()));
        }
        if options.stores == 0 {
            return Err(Error::InvalidArgument(format!("{} needs at least one store", address)));
        }

        let _open = self.inner.open_lock.lock().await;
        self.inner.ensure_running()?;

        let existing = self.inner.programs.read().get(address).map(|p| p.typed.clone());
        if let Some(existing) = existing {
            return existing
                .downcast::<Program<T>>()
                .map_err(|_| Error::InvalidArgument(format!("{} is open with another payload type", address)));
        }

        let cache = self.inner.cache.as_ref();
        match read_manifest(cache, address).await? {
            Some(_) => {}
            None if options.local_only => return Err(Error::NotFound(address.to_string())),
            None => write_manifest(cache, address, &manifest_hash(address, options.stores)).await?,
        }

        let mut stores = Vec::with_capacity(options.stores);
        for index in 0..options.stores {
            let mut log_options = LogOptions::new()
                .with_blocks(self.inner.blocks.clone())
                .with_keystore(self.inner.keystore.clone())
                .with_fetch_timeout(self.inner.config.fetch_timeout)
                .with_encryption(options.encryption.clone());
            if let Some(trim) = options.trim {
                log_options = log_options.with_trim(trim);
            }
            let store = Store::open(
                index as u32,
                format!("{}/{}", address, index),
                self.inner.identity.clone(),
                log_options,
                self.inner.cache.clone(),
            )
            .await?;
            stores.push(store);
        }

        let weak: Weak<NodeInner> = Arc::downgrade(&self.inner);
        let hook: Weak<dyn WriteHook> = weak;
        let role = options.role;
        let program = Arc::new(Program::new(
            address.to_string(),
            role,
            options.min_replicas.unwrap_or(self.inner.config.min_replicas),
            options.sync,
            options.trust,
            self.inner.keystore.clone(),
            stores,
            hook,
        ));

        for (peer, data) in self.inner.pubsub.subscribers(address).await {
            self.inner.on_subscribe(&peer, address, &data);
        }
        let erased: Arc<dyn ReplicatedProgram> = program.clone();
        let typed: Arc<dyn Any + Send + Sync> = program.clone();
        self.inner.programs.write().insert(
            address.to_string(),
            OpenedProgram {
                erased,
                typed,
                history: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            },
        );
        self.inner.pubsub.subscribe(address, role.to_bytes()).await?;
        info!(address = %address, role = ?role, "Opened program");

        self.inner.reorganize(address).await?;
        Ok(program)
    }

    /// Closes a program. Returns false if it was not open.
    pub async fn close(&self, address: &str) -> Result<bool> {
        let _open = self.inner.open_lock.lock().await;
        let Some(opened) = self.inner.programs.write().remove(address) else {
            return Ok(false);
        };
        let _reorg = opened.history.lock().await;
        self.inner.pubsub.unsubscribe(address).await?;
        debug!(address = %address, "Closed program");
        Ok(true)
    }

    /// Stops the node: waits for pending opens and reorganizations, closes
    /// every program and stops the event loop.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _open = self.inner.open_lock.lock().await;
        let programs: Vec<(String, OpenedProgram)> = self.inner.programs.write().drain().collect();
        for (address, opened) in programs {
            let _reorg = opened.history.lock().await;
            if let Err(err) = self.inner.pubsub.unsubscribe(&address).await {
                debug!(address = %address, error = %err, "Unsubscribe failed while stopping");
            }
        }
        // The event loop may already be gone with its receiver.
        let _ = self.inner.shutdown.send(true);
        let task = self.inner.event_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "Event loop ended abnormally");
            }
        }
        info!(peer = %self.peer_id(), "Node stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Runs one reorganization pass over each address. Addresses are
    /// processed concurrently. Returns true if any gid gained a leader.
    pub async fn replication_reorganization(&self, addresses: &[&str]) -> Result<bool> {
        self.inner.ensure_running()?;
        let results = join_all(addresses.iter().map(|address| self.inner.reorganize(address))).await;
        let mut changed = false;
        for result in results {
            changed |= result?;
        }
        Ok(changed)
    }

    /// The `n` leaders of `subject` among the replicators of `address`.
    pub fn find_leaders(&self, address: &str, subject: &str, n: usize) -> Vec<String> {
        find_leaders(&self.inner.candidates(address), subject, n)
    }

    /// Whether this node leads `subject` with the program's replica count.
    pub fn is_leader(&self, address: &str, subject: &str) -> Result<bool> {
        let program = self
            .inner
            .program(address)
            .ok_or_else(|| Error::NotFound(address.to_string()))?;
        Ok(self.inner.leaders(program.as_ref(), subject).iter().any(|p| p == self.peer_id()))
    }

    /// Sorted replicators of `address` that may be chosen as leaders. Includes
    /// this node when it opened the program as a replicator.
    pub fn replicators(&self, address: &str) -> Vec<String> {
        self.inner.candidates(address)
    }

    /// Sends the peers this node is connected to, except `to` itself, so
    /// `to` can dial them. Returns false if there was nothing to send or the
    /// send failed.
    pub async fn exchange_swarm(&self, to: &str) -> Result<bool> {
        self.inner.ensure_running()?;
        let local_network = self.inner.config.local_network;
        let info: Vec<PeerInfo> = self
            .inner
            .pubsub
            .connected_peers()
            .await
            .into_iter()
            .filter(|peer| peer.id != to)
            .filter_map(|peer| {
                let addresses: Vec<String> = peer
                    .addresses
                    .into_iter()
                    .filter(|address| local_network || !is_loopback(address))
                    .collect();
                (!addresses.is_empty()).then_some(PeerInfo { id: peer.id, addresses })
            })
            .collect();
        if info.is_empty() {
            return Ok(false);
        }
        let message = TransportMessage::ExchangeSwarm(ExchangeSwarmMessage { info });
        Ok(self.inner.publish(&message, PublishTarget::To(vec![to.to_string()])).await)
    }
}

fn manifest_hash(address: &str, stores: usize) -> Hash {
    Hash::digest(format!("{}#{}", address, stores).as_bytes())
}

fn is_loopback(address: &str) -> bool {
    address.contains("/127.0.0.1/") || address.contains("/::1/")
}

async fn run_events(
    inner: Weak<NodeInner>,
    mut events: mpsc::Receiver<PubSubEvent>,
    mut shutdown: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let Some(node) = inner.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            node.handle_event(event).await;
            drop(permit);
        });
    }
    debug!("Event loop stopped");
}

impl NodeInner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn me(&self) -> &str {
        self.pubsub.local_id()
    }

    fn program(&self, address: &str) -> Option<Arc<dyn ReplicatedProgram>> {
        self.programs.read().get(address).map(|p| p.erased.clone())
    }

    /// Leader candidates of an open program, honoring its role and trust
    /// filter.
    fn program_candidates(&self, program: &dyn ReplicatedProgram) -> Vec<String> {
        let me = program.role().is_replicator().then(|| self.me());
        let trust = program.trust();
        self.replicators
            .read()
            .get(program.address())
            .cloned()
            .unwrap_or_default()
            .candidates(me, trust.as_deref())
    }

    fn candidates(&self, address: &str) -> Vec<String> {
        match self.program(address) {
            Some(program) => self.program_candidates(program.as_ref()),
            None => self
                .replicators
                .read()
                .get(address)
                .map(|set| set.as_slice().to_vec())
                .unwrap_or_default(),
        }
    }

    fn leaders(&self, program: &dyn ReplicatedProgram, subject: &str) -> Vec<String> {
        find_leaders(&self.program_candidates(program), subject, program.min_replicas())
    }

    async fn handle_event(&self, event: PubSubEvent) {
        match event {
            PubSubEvent::Data { from, data, .. } => self.on_data(&from, &data).await,
            PubSubEvent::Subscribe { from, topic, data } => {
                if self.on_subscribe(&from, &topic, &data) {
                    self.reorganize_logged(&topic).await;
                }
            }
            PubSubEvent::Unsubscribe { from, topic } => {
                let removed = self
                    .replicators
                    .write()
                    .get_mut(&topic)
                    .map_or(false, |set| set.remove(&from));
                if removed {
                    debug!(peer = %from, topic = %topic, "Replicator left");
                    self.reorganize_logged(&topic).await;
                }
            }
            PubSubEvent::Connected { peer } => {
                let me = self.me().to_string();
                let reached = self.routes.lock().add_link(&me, &peer, None);
                trace!(peer = %peer, reached = reached.len(), "Peer connected");
            }
            PubSubEvent::Disconnected { peer } => self.on_disconnected(&peer).await,
        }
    }

    /// Records a subscription. Returns true if the replicator set of an
    /// open program changed.
    fn on_subscribe(&self, from: &str, topic: &str, data: &[u8]) -> bool {
        if from == self.me() {
            return false;
        }
        let role = match SubscriptionRole::from_bytes(data) {
            Ok(role) => role,
            Err(err) => {
                warn!(peer = %from, topic = %topic, error = %err, "Ignoring subscription with bad role");
                return false;
            }
        };
        let changed = {
            let mut replicators = self.replicators.write();
            let set = replicators.entry(topic.to_string()).or_default();
            if role.is_replicator() {
                set.insert(from)
            } else {
                set.remove(from)
            }
        };
        if changed {
            debug!(peer = %from, topic = %topic, role = ?role, "Subscription changed");
        }
        changed && self.programs.read().contains_key(topic)
    }

    async fn on_disconnected(&self, peer: &str) {
        let me = self.me().to_string();
        let dropped = {
            let mut routes = self.routes.lock();
            let mut dropped = routes.delete_link(&me, peer, None);
            if !routes.has_node(peer) && !dropped.iter().any(|p| p == peer) {
                dropped.push(peer.to_string());
            }
            dropped
        };
        let affected: Vec<String> = {
            let mut replicators = self.replicators.write();
            replicators
                .iter_mut()
                .filter_map(|(topic, set)| {
                    let mut changed = false;
                    for gone in &dropped {
                        changed |= set.remove(gone);
                    }
                    changed.then(|| topic.clone())
                })
                .collect()
        };
        debug!(peer = %peer, unreachable = dropped.len(), programs = affected.len(), "Peer disconnected");
        for topic in affected {
            self.reorganize_logged(&topic).await;
        }
    }

    async fn on_data(&self, from: &str, data: &[u8]) {
        let received = match decode_message(data, Some(self.keystore.as_ref())).await {
            Ok(received) => received,
            Err(NetworkError::AccessDenied) | Err(NetworkError::InvalidSignature) => return,
            Err(err) => {
                debug!(peer = %from, error = %err, "Dropping malformed message");
                return;
            }
        };
        match received.message {
            TransportMessage::ExchangeHeads(message) => self.on_exchange_heads(from, message).await,
            TransportMessage::ExchangeSwarm(message) => self.on_exchange_swarm(message).await,
        }
    }

    async fn on_exchange_heads(&self, from: &str, message: ExchangeHeadsMessage) {
        let Some(program) = self.program(&message.program_address) else {
            trace!(peer = %from, address = %message.program_address, "Heads for a program that is not open");
            return;
        };
        let me = self.me();
        let is_leader = |gid: &str| self.leaders(program.as_ref(), gid).iter().any(|p| p == me);
        match program
            .receive_heads(message.store_index, message.heads, &is_leader)
            .await
        {
            Ok(result) => {
                if !result.added.is_empty() {
                    debug!(
                        peer = %from,
                        address = %message.program_address,
                        store = message.store_index,
                        added = result.added.len(),
                        "Received heads"
                    );
                }
            }
            Err(err) => warn!(peer = %from, address = %message.program_address, error = %err, "Failed to join heads"),
        }
    }

    async fn on_exchange_swarm(&self, message: ExchangeSwarmMessage) {
        for peer in message.info {
            if peer.id == self.me() {
                continue;
            }
            if let Err(err) = self.pubsub.dial(&peer.id, &peer.addresses).await {
                warn!(peer = %peer.id, error = %err, "Failed to dial swarm peer");
            }
        }
    }

    async fn reorganize_logged(&self, address: &str) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.reorganize(address).await {
            warn!(address = %address, error = %err, "Replication reorganization failed");
        }
    }

    /// One reorganization pass over a program. Serialized per program.
    async fn reorganize(&self, address: &str) -> Result<bool> {
        let opened = {
            let programs = self.programs.read();
            programs.get(address).map(|p| (p.erased.clone(), p.history.clone()))
        };
        let Some((program, history)) = opened else {
            return Ok(false);
        };
        let mut history = history.lock().await;

        let mut stores = Vec::with_capacity(program.store_count() as usize);
        for index in 0..program.store_count() {
            stores.push(program.heads_by_gid(index).await?);
        }
        let candidates = self.program_candidates(program.as_ref());
        let replicas = program.min_replicas();
        let plan = reorg::plan(
            self.me(),
            &stores,
            |gid| find_leaders(&candidates, gid, replicas),
            &history,
        );

        for send in &plan.sends {
            if !self.send_heads(program.as_ref(), send.store_index, &send.heads, send.to.clone()).await {
                warn!(address = %address, gid = %send.gid, to = ?send.to, "Skipping heads for new leaders");
            }
        }
        for prune in &plan.prunes {
            match program.remove_recursively(prune.store_index, &prune.heads).await {
                Ok(removed) => {
                    debug!(address = %address, gid = %prune.gid, removed, "Pruned entries of a gid led elsewhere");
                }
                Err(err) => {
                    warn!(
                        address = %address,
                        gid = %prune.gid,
                        store = prune.store_index,
                        error = %err,
                        "Failed to prune gid"
                    );
                }
            }
        }
        let changed = plan.changed();
        history.extend(plan.history);
        for store in &plan.changed_stores {
            if let Err(err) = program.trim(*store).await {
                warn!(address = %address, store = *store, error = %err, "Failed to trim store");
            }
        }
        if changed {
            debug!(address = %address, sends = plan.sends.len(), prunes = plan.prunes.len(), "Reorganized replication");
        }
        Ok(changed)
    }

    async fn send_heads(&self, program: &dyn ReplicatedProgram, store_index: u32, heads: &[Hash], to: Vec<String>) -> bool {
        let heads = match program
            .exchange_heads(store_index, heads, self.config.max_exchange_references)
            .await
        {
            Ok(heads) if !heads.is_empty() => heads,
            Ok(_) => return false,
            Err(err) => {
                warn!(address = %program.address(), error = %err, "Failed to collect heads");
                return false;
            }
        };
        let message = TransportMessage::ExchangeHeads(ExchangeHeadsMessage {
            program_address: program.address().to_string(),
            store_index,
            heads,
        });
        self.publish(&message, PublishTarget::To(to)).await
    }

    /// Signs (unless `limit_signing`) and publishes under `exchange_timeout`.
    async fn publish(&self, message: &TransportMessage, target: PublishTarget) -> bool {
        let identity = (!self.config.limit_signing).then_some(&self.identity);
        let bytes = match encode_message(message, identity, None).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "Failed to encode message");
                return false;
            }
        };
        match tokio::time::timeout(self.config.exchange_timeout, self.pubsub.publish(bytes, target.clone())).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(target = ?target, error = %err, "Failed to publish");
                false
            }
            Err(_) => {
                warn!(target = ?target, timeout = ?self.config.exchange_timeout, "Publish timed out");
                false
            }
        }
    }
}

#[async_trait]
impl WriteHook for NodeInner {
    async fn on_write(&self, address: &str, store_index: u32, head: Hash, gid: String) {
        let Some(program) = self.program(address) else {
            return;
        };
        let me = self.me();
        let to: Vec<String> = self
            .leaders(program.as_ref(), &gid)
            .into_iter()
            .filter(|peer| peer != me)
            .collect();
        if to.is_empty() {
            return;
        }
        if !self.send_heads(program.as_ref(), store_index, &[head], to).await {
            debug!(address = %address, gid = %gid, "Write not pushed to leaders");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdrl_net::MemoryNetwork;

    fn node(network: &MemoryNetwork, id: &str) -> Node {
        Node::builder(Arc::new(network.join(id))).build().unwrap()
    }

    #[test]
    fn test_loopback_addresses() {
        assert!(is_loopback("/ip4/127.0.0.1/tcp/4001"));
        assert!(!is_loopback("/ip4/10.0.0.2/tcp/4001"));
        assert!(!is_loopback("/memory/a"));
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let network = MemoryNetwork::new();
        let pubsub: Arc<dyn PubSub> = Arc::new(network.join("a"));
        let _node = Node::builder(pubsub.clone()).build().unwrap();
        assert!(matches!(
            Node::builder(pubsub).build().err(),
            Some(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_arguments() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a");
        assert!(matches!(
            a.open::<String>("", OpenOptions::new()).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            a.open::<String>("db", OpenOptions::new().with_stores(0)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_single_node_leads_everything() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a");
        a.open::<String>("db", OpenOptions::new()).await.unwrap();
        assert_eq!(a.replicators("db"), vec!["a".to_string()]);
        assert!(a.is_leader("db", "any-gid").unwrap());
        assert!(matches!(a.is_leader("other", "gid"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_close_and_stop() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a");
        a.open::<String>("db", OpenOptions::new()).await.unwrap();
        assert!(a.close("db").await.unwrap());
        assert!(!a.close("db").await.unwrap());

        a.stop().await.unwrap();
        assert!(a.is_stopped());
        assert!(matches!(
            a.open::<String>("db", OpenOptions::new()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(a.replication_reorganization(&["db"]).await, Err(Error::Closed)));
        a.stop().await.unwrap();
    }
}

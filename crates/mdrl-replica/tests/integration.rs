//! Integration tests for nodes replicating over an in-memory network.
//!
//! Tests cover:
//! - Pushing writes to leaders and handing heads to late joiners
//! - Completing a gid's history from a shared block store
//! - Convergence of repeated reorganization passes
//! - Pruning gids a node no longer leads, even when one store fails
//! - Send failures, observers, trust filters and swarm exchange
//! - Reopening programs and restoring stores from a shared cache

use async_trait::async_trait;
use mdrl_log::{AppendOptions, BlockStore, Identity, MemoryBlockStore};
use mdrl_net::{
    ConnectedPeer, MemoryNetwork, MemoryPubSub, NetworkError, PubSub, PubSubEvent, PublishTarget, SubscriptionRole,
};
use mdrl_replica::{find_leaders, Cache, Error, MemoryCache, Node, NodeConfig, OpenOptions, Program};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn node(network: &MemoryNetwork, id: &str) -> Node {
    Node::builder(Arc::new(network.join(id))).build().unwrap()
}

/// Polls `check` until it holds or about two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn len(program: &Program<String>) -> usize {
    program.store(0).unwrap().len().await
}

/// A gid whose two leaders among `peers` do not include `excluded`.
fn gid_not_led_by(peers: &[&str], excluded: &str) -> String {
    let sorted: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
    (0..)
        .map(|i| format!("gid-{}", i))
        .find(|gid| !find_leaders(&sorted, gid, 2).contains(&excluded.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_write_reaches_other_replicator() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let b = node(&network, "b");
    network.connect_all(&["a", "b"]).await.unwrap();

    let pa = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    let pb = b.open::<String>("db", OpenOptions::new()).await.unwrap();
    assert!(eventually(|| async { a.replicators("db").len() == 2 }).await);

    pa.append(0, "hello".to_string(), AppendOptions::new()).await.unwrap();
    assert!(eventually(|| async { len(&pb).await == 1 }).await);

    let received = pb.store(0).unwrap().values().await;
    assert_eq!(received[0].payload().unwrap(), "hello");
    assert!(!received[0].created_locally());
}

#[tokio::test]
async fn test_late_joiner_receives_heads() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let pa = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    for i in 0..3 {
        pa.append(0, format!("entry-{}", i), AppendOptions::new()).await.unwrap();
    }

    let b = node(&network, "b");
    network.connect("a", "b").await.unwrap();
    let pb = b.open::<String>("db", OpenOptions::new()).await.unwrap();

    assert!(eventually(|| async { len(&pb).await == 3 }).await);
    assert!(!a.replication_reorganization(&["db"]).await.unwrap());

    // b has not recorded leaders for the received gid yet
    b.replication_reorganization(&["db"]).await.unwrap();
    assert!(!b.replication_reorganization(&["db"]).await.unwrap());
}

#[tokio::test]
async fn test_former_leader_prunes_gid() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let b = node(&network, "b");
    let c = node(&network, "c");
    network.connect("a", "b").await.unwrap();

    let pa = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    let pb = b.open::<String>("db", OpenOptions::new()).await.unwrap();
    assert!(eventually(|| async { a.replicators("db").len() == 2 }).await);

    let gid = gid_not_led_by(&["a", "b", "c"], "b");
    pa.append(0, "x".to_string(), AppendOptions::new().with_next(vec![]).with_gid(gid.clone()))
        .await
        .unwrap();
    assert!(eventually(|| async { len(&pb).await == 1 }).await);

    network.connect("c", "a").await.unwrap();
    network.connect("c", "b").await.unwrap();
    let pc = c.open::<String>("db", OpenOptions::new()).await.unwrap();

    assert!(eventually(|| async { len(&pb).await == 0 }).await);
    assert!(eventually(|| async { len(&pc).await == 1 }).await);
    assert_eq!(len(&pa).await, 1);
    assert!(!b.is_leader("db", &gid).unwrap());
    assert!(c.is_leader("db", &gid).unwrap());
}

#[tokio::test]
async fn test_late_leader_fetches_full_history() {
    let network = MemoryNetwork::new();
    let blocks: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
    let a = Node::builder(Arc::new(network.join("a")))
        .blocks(blocks.clone())
        .build()
        .unwrap();
    let pa = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    for i in 0..100 {
        pa.append(0, format!("entry-{}", i), AppendOptions::new()).await.unwrap();
    }
    assert_eq!(pa.heads_by_gid_info(0).await.unwrap().len(), 1);

    let b = Node::builder(Arc::new(network.join("b")))
        .blocks(blocks)
        .build()
        .unwrap();
    network.connect("a", "b").await.unwrap();
    let pb = b.open::<String>("db", OpenOptions::new()).await.unwrap();

    assert!(eventually(|| async { len(&pb).await == 100 }).await);
    let store = pb.store(0).unwrap();
    assert!(store.read(|log| log.tails().is_empty()).await);
}

/// A cache that refuses writes under `prefix` once `failing` is set.
struct FlakyCache {
    inner: MemoryCache,
    prefix: &'static str,
    failing: AtomicBool,
}

#[async_trait]
impl Cache for FlakyCache {
    async fn get(&self, key: &str) -> mdrl_replica::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> mdrl_replica::Result<()> {
        if self.failing.load(Ordering::SeqCst) && key.starts_with(self.prefix) {
            return Err(Error::InvalidArgument(format!("cache offline for {}", key)));
        }
        self.inner.set(key, value).await
    }

    async fn del(&self, key: &str) -> mdrl_replica::Result<()> {
        self.inner.del(key).await
    }
}

#[tokio::test]
async fn test_failed_prune_does_not_block_other_stores() {
    let network = MemoryNetwork::new();
    let cache = Arc::new(FlakyCache {
        inner: MemoryCache::new(),
        prefix: "db/0/",
        failing: AtomicBool::new(false),
    });
    let cache_dyn: Arc<dyn Cache> = cache.clone();
    let a = node(&network, "a");
    let b = Node::builder(Arc::new(network.join("b")))
        .cache(cache_dyn)
        .build()
        .unwrap();
    let c = node(&network, "c");
    network.connect("a", "b").await.unwrap();

    let pa = a.open::<String>("db", OpenOptions::new().with_stores(2)).await.unwrap();
    let pb = b.open::<String>("db", OpenOptions::new().with_stores(2)).await.unwrap();
    assert!(eventually(|| async { a.replicators("db").len() == 2 }).await);

    let gid = gid_not_led_by(&["a", "b", "c"], "b");
    for store in 0..2 {
        pa.append(store, format!("x{}", store), AppendOptions::new().with_next(vec![]).with_gid(gid.clone()))
            .await
            .unwrap();
    }
    let store_len = |index: u32| {
        let pb = pb.clone();
        async move { pb.store(index).unwrap().len().await }
    };
    assert!(eventually(|| async { store_len(0).await == 1 && store_len(1).await == 1 }).await);

    cache.failing.store(true, Ordering::SeqCst);
    network.connect("c", "a").await.unwrap();
    network.connect("c", "b").await.unwrap();
    c.open::<String>("db", OpenOptions::new().with_stores(2)).await.unwrap();

    assert!(eventually(|| async { store_len(1).await == 0 }).await);
    assert!(b.replication_reorganization(&["db"]).await.is_ok());
}

/// Delegates to a memory transport but fails every direct send.
struct FailingPubSub {
    inner: MemoryPubSub,
}

#[async_trait]
impl PubSub for FailingPubSub {
    fn local_id(&self) -> &str {
        self.inner.local_id()
    }

    fn addresses(&self) -> Vec<String> {
        self.inner.addresses()
    }

    async fn publish(&self, data: Vec<u8>, target: PublishTarget) -> mdrl_net::Result<()> {
        match target {
            PublishTarget::To(peers) => Err(NetworkError::SendFailed(peers.join(","))),
            target => self.inner.publish(data, target).await,
        }
    }

    async fn subscribe(&self, topic: &str, data: Vec<u8>) -> mdrl_net::Result<()> {
        self.inner.subscribe(topic, data).await
    }

    async fn unsubscribe(&self, topic: &str) -> mdrl_net::Result<()> {
        self.inner.unsubscribe(topic).await
    }

    async fn subscribers(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        self.inner.subscribers(topic).await
    }

    async fn dial(&self, peer: &str, addresses: &[String]) -> mdrl_net::Result<()> {
        self.inner.dial(peer, addresses).await
    }

    async fn connected_peers(&self) -> Vec<ConnectedPeer> {
        self.inner.connected_peers().await
    }

    fn events(&self) -> Option<mpsc::Receiver<PubSubEvent>> {
        self.inner.events()
    }
}

#[tokio::test]
async fn test_send_failure_is_skipped() {
    let network = MemoryNetwork::new();
    let a = Node::builder(Arc::new(FailingPubSub { inner: network.join("a") }))
        .build()
        .unwrap();
    let b = node(&network, "b");
    network.connect("a", "b").await.unwrap();

    let pa = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    pa.append(0, "lost".to_string(), AppendOptions::new()).await.unwrap();
    let pb = b.open::<String>("db", OpenOptions::new()).await.unwrap();

    assert!(eventually(|| async { a.replicators("db").len() == 2 }).await);
    assert!(a.replication_reorganization(&["db"]).await.is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(len(&pb).await, 0);
    assert_eq!(len(&pa).await, 1);
}

#[tokio::test]
async fn test_observers_are_not_replicators() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let b = node(&network, "b");
    let c = node(&network, "c");
    network.connect_all(&["a", "b", "c"]).await.unwrap();

    a.open::<String>("db", OpenOptions::new()).await.unwrap();
    b.open::<String>("db", OpenOptions::new().with_role(SubscriptionRole::Observer))
        .await
        .unwrap();
    c.open::<String>("db", OpenOptions::new()).await.unwrap();

    let expected = vec!["a".to_string(), "c".to_string()];
    assert!(eventually(|| async { a.replicators("db") == expected }).await);
    assert!(eventually(|| async { b.replicators("db") == expected }).await);
    assert!(!b.is_leader("db", "any").unwrap());
}

#[tokio::test]
async fn test_untrusted_peers_are_never_leaders() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let b = node(&network, "b");
    network.connect("a", "b").await.unwrap();

    b.open::<String>("db", OpenOptions::new()).await.unwrap();
    let trusted_only_self = OpenOptions::new().with_trust(Arc::new(|peer: &str| peer == "a"));
    let pa = a.open::<String>("db", trusted_only_self).await.unwrap();

    assert_eq!(a.replicators("db"), vec!["a".to_string()]);
    pa.append(0, "private".to_string(), AppendOptions::new()).await.unwrap();
    assert!(!a.replication_reorganization(&["db"]).await.unwrap());
}

#[tokio::test]
async fn test_local_only_requires_manifest() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    assert!(matches!(
        a.open::<String>("db", OpenOptions::new().local_only()).await,
        Err(Error::NotFound(_))
    ));

    a.open::<String>("db", OpenOptions::new()).await.unwrap();
    assert!(a.close("db").await.unwrap());
    assert!(a.open::<String>("db", OpenOptions::new().local_only()).await.is_ok());
}

#[tokio::test]
async fn test_corrupt_head_cache_fails_open() {
    let network = MemoryNetwork::new();
    let cache = Arc::new(MemoryCache::new());
    cache.set_raw("db/0/_heads", vec![1, 2, 3]);
    let cache_dyn: Arc<dyn Cache> = cache;
    let a = Node::builder(Arc::new(network.join("a")))
        .cache(cache_dyn)
        .build()
        .unwrap();

    assert!(matches!(
        a.open::<String>("db", OpenOptions::new()).await,
        Err(Error::CorruptCache { .. })
    ));
}

#[tokio::test]
async fn test_reopen_returns_same_program() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let first = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    let second = a.open::<String>("db", OpenOptions::new()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert!(matches!(
        a.open::<u64>("db", OpenOptions::new()).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_restart_restores_stores() {
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let blocks: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
    let identity = Identity::from_seed([7; 32]);

    let first_network = MemoryNetwork::new();
    let first = Node::builder(Arc::new(first_network.join("a")))
        .identity(identity.clone())
        .cache(cache.clone())
        .blocks(blocks.clone())
        .build()
        .unwrap();
    let program = first.open::<String>("db", OpenOptions::new().with_stores(2)).await.unwrap();
    for i in 0..3 {
        program.append(1, i.to_string(), AppendOptions::new()).await.unwrap();
    }
    first.stop().await.unwrap();

    let second_network = MemoryNetwork::new();
    let second = Node::builder(Arc::new(second_network.join("a")))
        .identity(identity)
        .cache(cache)
        .blocks(blocks)
        .build()
        .unwrap();
    let program = second
        .open::<String>("db", OpenOptions::new().with_stores(2).local_only())
        .await
        .unwrap();
    assert_eq!(program.store(0).unwrap().len().await, 0);
    assert_eq!(program.store(1).unwrap().len().await, 3);
    assert_eq!(program.heads_by_gid_info(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_exchange_swarm_dials_peers() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    let _b = node(&network, "b");
    let _c = node(&network, "c");
    network.connect("a", "b").await.unwrap();
    network.connect("a", "c").await.unwrap();
    assert!(!network.is_connected("b", "c"));

    assert!(a.exchange_swarm("b").await.unwrap());
    assert!(eventually(|| async { network.is_connected("b", "c") }).await);
}

#[tokio::test]
async fn test_exchange_swarm_skips_loopback() {
    let network = MemoryNetwork::new();
    let loopback = vec!["/ip4/127.0.0.1/tcp/4001".to_string()];
    let a = node(&network, "a");
    let local = Node::builder(Arc::new(network.join("l")))
        .config(NodeConfig::builder().local_network(true).build())
        .build()
        .unwrap();
    let _b = node(&network, "b");
    let _x = network.join_with_addresses("x", loopback);
    network.connect("a", "b").await.unwrap();
    network.connect("a", "x").await.unwrap();
    network.connect("l", "b").await.unwrap();
    network.connect("l", "x").await.unwrap();

    assert!(!a.exchange_swarm("b").await.unwrap());
    assert!(local.exchange_swarm("b").await.unwrap());
}

#[tokio::test]
async fn test_stopped_node_rejects_calls() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a");
    a.open::<String>("db", OpenOptions::new()).await.unwrap();
    a.stop().await.unwrap();

    assert!(matches!(
        a.open::<String>("db", OpenOptions::new()).await,
        Err(Error::Closed)
    ));
    assert!(matches!(a.exchange_swarm("b").await, Err(Error::Closed)));
}

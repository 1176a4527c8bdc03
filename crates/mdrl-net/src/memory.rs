//! In-process pub/sub for tests and simulation.
//!
//! A [`MemoryNetwork`] is a hub that every [`MemoryPubSub`] registers with.
//! Peers only see each other's subscriptions once connected. Direct messages
//! are relayed over any chain of connections.

use crate::error::{NetworkError, Result};
use crate::transport::{ConnectedPeer, PubSub, PubSubEvent, PublishTarget};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const EVENT_BUFFER: usize = 1024;

struct PeerSlot {
    tx: mpsc::Sender<PubSubEvent>,
    addresses: Vec<String>,
    subscriptions: HashMap<String, Vec<u8>>,
    connections: BTreeSet<String>,
}

/// Shared hub connecting in-memory peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<RwLock<HashMap<String, PeerSlot>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer reachable at `/memory/<id>`.
    pub fn join(&self, id: impl Into<String>) -> MemoryPubSub {
        let id = id.into();
        let addresses = vec![format!("/memory/{}", id)];
        self.join_with_addresses(id, addresses)
    }

    pub fn join_with_addresses(&self, id: impl Into<String>, addresses: Vec<String>) -> MemoryPubSub {
        let id = id.into();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.peers.write().insert(
            id.clone(),
            PeerSlot {
                tx,
                addresses,
                subscriptions: HashMap::new(),
                connections: BTreeSet::new(),
            },
        );
        MemoryPubSub {
            id,
            network: self.clone(),
            events: Mutex::new(Some(rx)),
        }
    }

    /// Connects two peers and replays their subscriptions to each other.
    pub async fn connect(&self, a: &str, b: &str) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let deliveries = {
            let mut peers = self.peers.write();
            if !peers.contains_key(a) {
                return Err(NetworkError::PeerNotFound(a.to_string()));
            }
            if !peers.contains_key(b) {
                return Err(NetworkError::PeerNotFound(b.to_string()));
            }
            let fresh = peers
                .get_mut(a)
                .map_or(false, |slot| slot.connections.insert(b.to_string()));
            if let Some(slot) = peers.get_mut(b) {
                slot.connections.insert(a.to_string());
            }
            if !fresh {
                return Ok(());
            }
            let mut deliveries = Vec::new();
            for (me, other) in [(a, b), (b, a)] {
                let (Some(mine), Some(theirs)) = (peers.get(me), peers.get(other)) else { continue };
                deliveries.push((mine.tx.clone(), PubSubEvent::Connected { peer: other.to_string() }));
                for (topic, data) in &theirs.subscriptions {
                    deliveries.push((
                        mine.tx.clone(),
                        PubSubEvent::Subscribe {
                            from: other.to_string(),
                            topic: topic.clone(),
                            data: data.clone(),
                        },
                    ));
                }
            }
            deliveries
        };
        debug!(a = %a, b = %b, "Connected memory peers");
        deliver(deliveries).await;
        Ok(())
    }

    /// Drops the connection between two peers. Each side sees the other
    /// unsubscribe from everything, then disconnect.
    pub async fn disconnect(&self, a: &str, b: &str) {
        let deliveries = {
            let mut peers = self.peers.write();
            let removed = peers
                .get_mut(a)
                .map_or(false, |slot| slot.connections.remove(b));
            if let Some(slot) = peers.get_mut(b) {
                slot.connections.remove(a);
            }
            if !removed {
                return;
            }
            let mut deliveries = Vec::new();
            for (me, other) in [(a, b), (b, a)] {
                let (Some(mine), Some(theirs)) = (peers.get(me), peers.get(other)) else { continue };
                for topic in theirs.subscriptions.keys() {
                    deliveries.push((
                        mine.tx.clone(),
                        PubSubEvent::Unsubscribe {
                            from: other.to_string(),
                            topic: topic.clone(),
                        },
                    ));
                }
                deliveries.push((mine.tx.clone(), PubSubEvent::Disconnected { peer: other.to_string() }));
            }
            deliveries
        };
        debug!(a = %a, b = %b, "Disconnected memory peers");
        deliver(deliveries).await;
    }

    /// Disconnects a peer from everyone and forgets it.
    pub async fn leave(&self, id: &str) {
        let connections: Vec<String> = self
            .peers
            .read()
            .get(id)
            .map(|slot| slot.connections.iter().cloned().collect())
            .unwrap_or_default();
        for other in connections {
            self.disconnect(id, &other).await;
        }
        self.peers.write().remove(id);
    }

    /// Connects every pair of the given peers.
    pub async fn connect_all(&self, ids: &[&str]) -> Result<()> {
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.connect(a, b).await?;
            }
        }
        Ok(())
    }

    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        self.peers
            .read()
            .get(a)
            .map_or(false, |slot| slot.connections.contains(b))
    }

    fn reachable(peers: &HashMap<String, PeerSlot>, from: &str) -> HashSet<String> {
        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            let Some(slot) = peers.get(node) else { continue };
            for next in &slot.connections {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        visited
    }
}

async fn deliver(deliveries: Vec<(mpsc::Sender<PubSubEvent>, PubSubEvent)>) {
    for (tx, event) in deliveries {
        if tx.send(event).await.is_err() {
            trace!("Dropping event for closed memory peer");
        }
    }
}

/// One peer's handle on a [`MemoryNetwork`].
pub struct MemoryPubSub {
    id: String,
    network: MemoryNetwork,
    events: Mutex<Option<mpsc::Receiver<PubSubEvent>>>,
}

impl MemoryPubSub {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn broadcast_to_connections(&self, event: impl Fn() -> PubSubEvent) -> Vec<(mpsc::Sender<PubSubEvent>, PubSubEvent)> {
        let peers = self.network.peers.read();
        let Some(me) = peers.get(&self.id) else { return Vec::new() };
        me.connections
            .iter()
            .filter_map(|peer| peers.get(peer))
            .map(|slot| (slot.tx.clone(), event()))
            .collect()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn addresses(&self) -> Vec<String> {
        self.network
            .peers
            .read()
            .get(&self.id)
            .map(|slot| slot.addresses.clone())
            .unwrap_or_default()
    }

    async fn publish(&self, data: Vec<u8>, target: PublishTarget) -> Result<()> {
        let deliveries = {
            let peers = self.network.peers.read();
            let me = peers.get(&self.id).ok_or(NetworkError::Closed)?;
            let mut deliveries = Vec::new();
            match target {
                PublishTarget::Topics(topics) => {
                    for peer in &me.connections {
                        let Some(slot) = peers.get(peer) else { continue };
                        let Some(topic) = topics.iter().find(|t| slot.subscriptions.contains_key(*t)) else {
                            continue;
                        };
                        deliveries.push((
                            slot.tx.clone(),
                            PubSubEvent::Data {
                                topic: Some(topic.clone()),
                                from: self.id.clone(),
                                data: data.clone(),
                            },
                        ));
                    }
                }
                PublishTarget::To(receivers) => {
                    let reachable = MemoryNetwork::reachable(&peers, &self.id);
                    for receiver in receivers.iter().filter(|r| **r != self.id) {
                        if !reachable.contains(receiver) {
                            return Err(NetworkError::PeerNotFound(receiver.clone()));
                        }
                        let Some(slot) = peers.get(receiver) else { continue };
                        deliveries.push((
                            slot.tx.clone(),
                            PubSubEvent::Data {
                                topic: None,
                                from: self.id.clone(),
                                data: data.clone(),
                            },
                        ));
                    }
                }
            }
            deliveries
        };
        trace!(from = %self.id, receivers = deliveries.len(), "Published message");
        deliver(deliveries).await;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        {
            let mut peers = self.network.peers.write();
            let me = peers.get_mut(&self.id).ok_or(NetworkError::Closed)?;
            me.subscriptions.insert(topic.to_string(), data.clone());
        }
        let deliveries = self.broadcast_to_connections(|| PubSubEvent::Subscribe {
            from: self.id.clone(),
            topic: topic.to_string(),
            data: data.clone(),
        });
        deliver(deliveries).await;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = {
            let mut peers = self.network.peers.write();
            let me = peers.get_mut(&self.id).ok_or(NetworkError::Closed)?;
            me.subscriptions.remove(topic).is_some()
        };
        if removed {
            let deliveries = self.broadcast_to_connections(|| PubSubEvent::Unsubscribe {
                from: self.id.clone(),
                topic: topic.to_string(),
            });
            deliver(deliveries).await;
        }
        Ok(())
    }

    async fn subscribers(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        let peers = self.network.peers.read();
        let Some(me) = peers.get(&self.id) else { return Vec::new() };
        me.connections
            .iter()
            .filter_map(|peer| {
                let data = peers.get(peer)?.subscriptions.get(topic)?;
                Some((peer.clone(), data.clone()))
            })
            .collect()
    }

    async fn dial(&self, peer: &str, _addresses: &[String]) -> Result<()> {
        self.network
            .connect(&self.id, peer)
            .await
            .map_err(|_| NetworkError::ConnectionFailed(peer.to_string()))
    }

    async fn connected_peers(&self) -> Vec<ConnectedPeer> {
        let peers = self.network.peers.read();
        let Some(me) = peers.get(&self.id) else { return Vec::new() };
        me.connections
            .iter()
            .filter_map(|peer| {
                peers.get(peer).map(|slot| ConnectedPeer {
                    id: peer.clone(),
                    addresses: slot.addresses.clone(),
                })
            })
            .collect()
    }

    fn events(&self) -> Option<mpsc::Receiver<PubSubEvent>> {
        self.events.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut mpsc::Receiver<PubSubEvent>) -> PubSubEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_replays_subscriptions() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let mut rx_b = b.events().unwrap();
        assert!(b.events().is_none());

        a.subscribe("topic", vec![0]).await.unwrap();
        network.connect("a", "b").await.unwrap();

        assert_eq!(next(&mut rx_b).await, PubSubEvent::Connected { peer: "a".into() });
        assert_eq!(
            next(&mut rx_b).await,
            PubSubEvent::Subscribe {
                from: "a".into(),
                topic: "topic".into(),
                data: vec![0]
            }
        );
        assert_eq!(b.subscribers("topic").await, vec![("a".to_string(), vec![0])]);
        assert!(a.subscribers("topic").await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_to_topic_subscribers_only() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let c = network.join("c");
        let mut rx_b = b.events().unwrap();
        let mut rx_c = c.events().unwrap();
        network.connect_all(&["a", "b", "c"]).await.unwrap();
        b.subscribe("t", vec![]).await.unwrap();

        a.publish(vec![42], PublishTarget::Topics(vec!["t".into()])).await.unwrap();

        loop {
            if let PubSubEvent::Data { topic, from, data } = next(&mut rx_b).await {
                assert_eq!(topic.as_deref(), Some("t"));
                assert_eq!(from, "a");
                assert_eq!(data, vec![42]);
                break;
            }
        }
        while let Ok(event) = rx_c.try_recv() {
            assert!(!matches!(event, PubSubEvent::Data { .. }));
        }
    }

    #[tokio::test]
    async fn test_direct_message_relays_over_connections() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let _b = network.join("b");
        let c = network.join("c");
        let _d = network.join("d");
        let mut rx_c = c.events().unwrap();
        network.connect("a", "b").await.unwrap();
        network.connect("b", "c").await.unwrap();

        a.publish(vec![1], PublishTarget::To(vec!["c".into()])).await.unwrap();
        loop {
            if let PubSubEvent::Data { topic, from, .. } = next(&mut rx_c).await {
                assert!(topic.is_none());
                assert_eq!(from, "a");
                break;
            }
        }

        let err = a.publish(vec![1], PublishTarget::To(vec!["d".into()])).await.unwrap_err();
        assert_eq!(err, NetworkError::PeerNotFound("d".into()));
    }

    #[tokio::test]
    async fn test_disconnect_unsubscribes() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let mut rx_a = a.events().unwrap();
        network.connect("a", "b").await.unwrap();
        b.subscribe("t", vec![1]).await.unwrap();
        assert_eq!(a.subscribers("t").await.len(), 1);

        network.disconnect("a", "b").await;
        assert!(!network.is_connected("a", "b"));
        assert!(a.subscribers("t").await.is_empty());

        let mut saw_unsubscribe = false;
        loop {
            match next(&mut rx_a).await {
                PubSubEvent::Unsubscribe { from, topic } => {
                    assert_eq!((from.as_str(), topic.as_str()), ("b", "t"));
                    saw_unsubscribe = true;
                }
                PubSubEvent::Disconnected { peer } => {
                    assert_eq!(peer, "b");
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_unsubscribe);
    }

    #[tokio::test]
    async fn test_dial_and_connected_peers() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let _b = network.join_with_addresses("b", vec!["/ip4/127.0.0.1/tcp/4002".into()]);
        a.dial("b", &[]).await.unwrap();
        let peers = a.connected_peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addresses, vec!["/ip4/127.0.0.1/tcp/4002".to_string()]);
        assert!(a.dial("nobody", &[]).await.is_err());
        assert_eq!(a.addresses(), vec!["/memory/a".to_string()]);
    }
}

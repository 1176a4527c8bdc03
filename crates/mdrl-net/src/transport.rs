//! Publish/subscribe transport abstraction.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Where a published message goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishTarget {
    /// Every subscriber of these topics.
    Topics(Vec<String>),
    /// These peers directly, whatever they subscribe to.
    To(Vec<String>),
}

/// Events delivered by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubSubEvent {
    /// A published message. `topic` is `None` for direct messages.
    Data {
        topic: Option<String>,
        from: String,
        data: Vec<u8>,
    },
    /// A peer subscribed to a topic with some subscription data.
    Subscribe {
        from: String,
        topic: String,
        data: Vec<u8>,
    },
    Unsubscribe {
        from: String,
        topic: String,
    },
    /// A direct connection came up.
    Connected { peer: String },
    Disconnected { peer: String },
}

/// A peer known to the transport with its dialable addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub id: String,
    pub addresses: Vec<String>,
}

#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// This peer's id.
    fn local_id(&self) -> &str;

    /// Addresses other peers can dial to reach us.
    fn addresses(&self) -> Vec<String>;

    async fn publish(&self, data: Vec<u8>, target: PublishTarget) -> Result<()>;

    /// Subscribes to `topic`, announcing `data` to current and future subscribers.
    async fn subscribe(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Remote subscribers of `topic` with their subscription data.
    async fn subscribers(&self, topic: &str) -> Vec<(String, Vec<u8>)>;

    /// Opens a direct connection to `peer`.
    async fn dial(&self, peer: &str, addresses: &[String]) -> Result<()>;

    async fn connected_peers(&self) -> Vec<ConnectedPeer>;

    /// Takes the event stream. Returns `None` after the first call.
    fn events(&self) -> Option<mpsc::Receiver<PubSubEvent>>;
}

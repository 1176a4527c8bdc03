//! # mdrl-net
//!
//! Networking pieces of the Lodestone replicated database:
//! - [`Routes`]: the undirected peer link graph with reachability upkeep
//! - Wire messages exchanged between nodes and their signed envelope
//! - The [`PubSub`] transport trait and an in-memory implementation

mod error;
mod memory;
mod message;
mod routes;
mod transport;

pub use error::{NetworkError, Result};
pub use memory::{MemoryNetwork, MemoryPubSub};
pub use message::{
    decode_message, encode_message, ExchangeHeadsMessage, ExchangeSwarmMessage, HeadWithRefs, PeerInfo,
    ReceivedMessage, SignedMessage, SubscriptionRole, TransportMessage,
};
pub use routes::{Link, Routes};
pub use transport::{ConnectedPeer, PubSub, PubSubEvent, PublishTarget};

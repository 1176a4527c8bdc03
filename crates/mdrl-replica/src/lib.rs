//! # mdrl-replica
//!
//! Replication layer of the Lodestone database.
//!
//! A [`Node`] opens programs: named sets of [`Store`]s, each a signed
//! Merkle-DAG log whose heads are persisted in a [`Cache`]. Peers that
//! subscribe to a program as replicators share its entries. Every gid is
//! held by `min_replicas` leaders chosen by rendezvous hashing over the
//! sorted replicator set, and when membership changes the node hands heads
//! to new leaders and drops the gids it no longer leads.
//!
//! ## Example
//!
//! ```rust
//! use mdrl_log::AppendOptions;
//! use mdrl_net::MemoryNetwork;
//! use mdrl_replica::{Node, OpenOptions};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let network = MemoryNetwork::new();
//! let node = Node::builder(Arc::new(network.join("alice"))).build().unwrap();
//!
//! let program = node.open::<String>("notes", OpenOptions::new()).await.unwrap();
//! program.append(0, "hello".to_string(), AppendOptions::new()).await.unwrap();
//! assert_eq!(program.store(0).unwrap().len().await, 1);
//!
//! node.stop().await.unwrap();
//! # });
//! ```
//!
//! ## Modules
//!
//! - [`leaders`]: leader selection and replicator sets
//! - [`reorg`]: pure planning of a reorganization pass

mod cache;
mod config;
mod error;
pub mod leaders;
mod node;
mod program;
pub mod reorg;
mod store;

pub use cache::{manifest_key, read_manifest, write_manifest, Cache, HeadCache, MemoryCache};
pub use config::{NodeConfig, NodeConfigBuilder, OpenOptions, SyncFilter};
pub use error::{Error, Result};
pub use leaders::{find_leaders, ReplicatorSet, TrustFilter};
pub use node::{Node, NodeBuilder};
pub use program::{EntryInfo, Program};
pub use reorg::{HeadInfo, PruneHeads, ReorgPlan, SendHeads, StoreHeads};
pub use store::Store;

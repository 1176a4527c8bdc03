//! # mdrl-log
//!
//! Signed Merkle-DAG append-only log for the Lodestone replicated database.
//!
//! This crate provides:
//! - Content-addressed, signed entries with optional per-field encryption
//! - Hybrid Lamport clocks giving a deterministic total order
//! - A log with head/tail tracking, deterministic join, trim and removal
//! - A block store abstraction for persisting and fetching entries
//!
//! ## Example
//!
//! ```rust
//! use mdrl_log::{AppendOptions, Identity, JoinOptions, Log, LogOptions};
//!
//! # tokio_test::block_on(async {
//! let mut alice: Log<String> = Log::new(Identity::generate(), LogOptions::new().with_id("doc")).unwrap();
//! let mut bob: Log<String> = Log::new(Identity::generate(), LogOptions::new().with_id("doc")).unwrap();
//!
//! alice.append("hello".to_string(), AppendOptions::new()).await.unwrap();
//! bob.append("world".to_string(), AppendOptions::new()).await.unwrap();
//!
//! alice.join(&bob, JoinOptions::default()).await.unwrap();
//! assert_eq!(alice.len(), 2);
//! assert_eq!(alice.heads().len(), 2);
//! # });
//! ```

mod blocks;
mod clock;
mod encryption;
mod entry;
mod error;
mod hash;
mod identity;
mod log;

pub use blocks::{get_with_timeout, BlockStore, MemoryBlockStore};
pub use clock::{now_nanos, LamportClock, Timestamp};
pub use encryption::{Envelope, KeyId, Keystore, MaybeEncrypted, MemoryKeystore, SealedBox, SymmetricKey};
pub use entry::{derive_gid, Entry, EntryBuilder, EntryEncryption, Meta};
pub use error::{Error, Result};
pub use hash::{Hash, Hasher};
pub use identity::{Identity, PublicSignKey, SignatureWithKey};
pub use log::{
    last_write_wins, newest_first, AppendOptions, AppendResult, JoinOptions, JoinResult, JoinSource, Log,
    LogOptions, RemoveOptions, RemoveResult, SortFn, TrimOptions,
};

//! Error types for the log layer.

use crate::hash::Hash;
use thiserror::Error;

/// Errors that can occur while building, decoding or merging entries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A caller broke the contract of a constructor or builder.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation needed state the log does not have.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An entry referenced by hash could not be found locally or in the block store.
    #[error("Entry not found: {}", .0.short())]
    MissingEntry(Hash),

    /// Bytes could not be decoded into the expected type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A value could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Re-hashing stored bytes did not reproduce the expected hash.
    #[error("Hash mismatch: expected {}, got {}", expected.short(), actual.short())]
    HashMismatch { expected: Hash, actual: Hash },

    /// None of the recipient keys of a sealed field are available locally.
    #[error("No key available to open sealed field")]
    AccessDenied,

    /// A field was read before it was decrypted.
    #[error("Field is still sealed: {0}")]
    Sealed(&'static str),

    /// Encryption or decryption failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The block store failed.
    #[error("Block store error: {0}")]
    BlockStore(String),

    /// A block fetch exceeded its deadline.
    #[error("Timed out fetching {}", .0.short())]
    Timeout(Hash),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

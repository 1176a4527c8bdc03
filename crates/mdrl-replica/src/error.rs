//! Error types for the replication layer.

use mdrl_net::NetworkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Log(#[from] mdrl_log::Error),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A program, store or manifest does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The node has been stopped.
    #[error("Node is closed")]
    Closed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Persisted cache data could not be decoded or its chain is broken.
    #[error("Corrupt cache at {key}: {reason}")]
    CorruptCache { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Network error type.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The message could not be decoded or failed its checks.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The message was sealed for keys we do not hold.
    #[error("Message not addressed to us")]
    AccessDenied,

    /// The message signature did not verify.
    #[error("Invalid message signature")]
    InvalidSignature,

    #[error("Transport closed")]
    Closed,
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::Malformed(err.to_string())
    }
}

impl From<mdrl_log::Error> for NetworkError {
    fn from(err: mdrl_log::Error) -> Self {
        match err {
            mdrl_log::Error::AccessDenied | mdrl_log::Error::Sealed(_) => NetworkError::AccessDenied,
            other => NetworkError::Malformed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

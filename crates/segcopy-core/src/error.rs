//! Error types for the segment copy core

use thiserror::Error;

/// Result type alias using the segment copy [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Transport failure classification
///
/// The remote proxy decides whether to retry a request from this kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not establish a connection to the target node
    ConnectFailed,
    /// An established connection dropped mid-request
    NodeDisconnected,
    /// The remote side shed load because a circuit breaker tripped
    CircuitBreaking,
    /// The remote side rejected execution (queue full)
    Rejected,
    /// The remote handler failed while processing the request
    Remote,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::NodeDisconnected => write!(f, "node disconnected"),
            Self::CircuitBreaking => write!(f, "circuit breaking"),
            Self::Rejected => write!(f, "rejected execution"),
            Self::Remote => write!(f, "remote failure"),
        }
    }
}

/// Core error types for segment copy
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from store or socket operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol violations (framing, CRC, unexpected message)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport failures, classified for retry
    #[error("Transport error ({kind}): {message}")]
    Transport {
        /// Failure class
        kind: TransportErrorKind,
        /// Detail
        message: String,
    },

    /// Shard store errors (missing files, checksum mismatch, commit failures)
    #[error("Store error: {0}")]
    Store(String),

    /// Shard lifecycle errors (shard missing, closed, wrong engine)
    #[error("Shard error: {0}")]
    Shard(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// The transfer was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A request or copy round ran out of time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a transport error of the given kind
    pub fn transport(kind: TransportErrorKind, msg: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: msg.into(),
        }
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a shard error
    pub fn shard(msg: impl Into<String>) -> Self {
        Self::Shard(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error came from a cancelled transfer
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::transport(TransportErrorKind::ConnectFailed, "node-2 refused");
        assert_eq!(
            err.to_string(),
            "Transport error (connect failed): node-2 refused"
        );
        assert!(matches!(Error::store("x"), Error::Store(_)));
        assert!(Error::cancelled("replica left").is_cancelled());
    }
}

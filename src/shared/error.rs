//! Sync Engine Error Types
//!
//! Every fallible operation in the engine returns [`SyncError`]. The variants
//! follow the failure taxonomy the engine reacts to:
//!
//! - **Transport** - connection refused, timeouts, transport-level drops.
//!   Retried by the transport's own backoff loop.
//! - **Send** - an emit failed after the connection was up. Retried through
//!   the offline queue only when [`SyncError::is_retryable`] says so.
//! - **Storage** - durable queue failures.
//! - **Resolution** - a conflict resolver failed; the conflict stays
//!   unresolved locally.
//!
//! # Usage
//!
//! ```rust
//! use schedsync::shared::error::SyncError;
//!
//! let err = SyncError::rejected("title must not be empty");
//! assert!(!err.is_retryable());
//! ```
use thiserror::Error;

use crate::shared::config::ConfigError;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure (refused, dropped, protocol error)
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable error message
        message: String,
    },

    /// An operation did not complete in time
    #[error("Timed out: {operation}")]
    Timeout {
        /// What timed out
        operation: String,
    },

    /// The connection is not in the `connected` state
    #[error("Not connected")]
    NotConnected,

    /// The server answered with an error status
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP-equivalent status code
        status: u16,
        /// Human-readable error message
        message: String,
    },

    /// The server (or local validation) rejected the payload
    #[error("Rejected: {message}")]
    Rejected {
        /// Human-readable error message
        message: String,
    },

    /// Durable queue failure
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A conflict resolver failed
    #[error("Conflict resolution failed: {message}")]
    Resolution {
        /// Human-readable error message
        message: String,
    },

    /// Invalid engine configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A queue item id that is not in the store
    #[error("Unknown queue item: {id}")]
    UnknownItem {
        /// The missing id
        id: String,
    },
}

impl SyncError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a server error
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Create a validation-class rejection
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Create a resolution error
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    /// Whether the failed operation may succeed if sent again later.
    ///
    /// Network, timeout and 5xx-class failures are retryable. Validation
    /// failures and 4xx-class answers are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { .. } | SyncError::Timeout { .. } | SyncError::NotConnected => {
                true
            }
            SyncError::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            SyncError::Storage(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            SyncError::Rejected { .. }
            | SyncError::Serialization(_)
            | SyncError::Resolution { .. }
            | SyncError::Config(_)
            | SyncError::UnknownItem { .. } => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(err.to_string())
    }
}

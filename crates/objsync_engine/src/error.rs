//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The remote store permanently rejected the batch.
    #[error("remote store rejected the batch")]
    Rejected,

    /// The engine stopped retrying after transient failures.
    #[error("gave up retrying after {attempts} failed attempts")]
    GaveUpRetrying {
        /// Number of failed attempts for the entity.
        attempts: u32,
    },

    /// The request expired and the transcoder does not retry expirations.
    #[error("request expired")]
    Expired,

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Configuration was rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The entity stopped being relevant before it was sent.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Expired => true,
            _ => false,
        }
    }
}

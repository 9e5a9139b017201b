//! Error types for entity synchronization.

use thiserror::Error;

/// Main error type for synchronization operations.
///
/// Errors are `Clone` because an activation keeps the most recent one as a
/// persistent signal that every reader of the handle can observe.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Snapshot fetch failed: {0}")]
    SnapshotFetch(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Remote source error: {0}")]
    Source(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("Activation has been deactivated")]
    Deactivated,
}

impl SyncError {
    /// True for failures of the initial snapshot load.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, SyncError::SnapshotFetch(_))
    }

    /// True for failures of the live event stream.
    pub fn is_subscription(&self) -> bool {
        matches!(self, SyncError::Subscription(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Thread(e.to_string())
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

//! Error types for synchronization.

use crate::types::EntityKind;
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Fetch failed for {kind}: {message}")]
    Fetch { kind: EntityKind, message: String },

    #[error("Invalid {kind} record: {message}")]
    InvalidRecord { kind: EntityKind, message: String },

    #[error("Channel error on {topic}: {message}")]
    Channel { topic: String, message: String },

    #[error("Subscription registry has been shut down")]
    RegistryShutdown,

    #[error("Controller has been torn down")]
    TornDown,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Shorthand for a fetch failure.
    pub fn fetch(kind: EntityKind, message: impl Into<String>) -> Self {
        SyncError::Fetch {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a channel failure.
    pub fn channel(topic: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Channel {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Whether this error should be shown to the consumer.
    ///
    /// Channel and probe problems are absorbed by the polling fallback, so
    /// they never reach [`SyncController::error`](crate::SyncController::error).
    pub fn is_user_visible(&self) -> bool {
        matches!(self, SyncError::Fetch { .. } | SyncError::InvalidRecord { .. })
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

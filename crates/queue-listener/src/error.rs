//! Error types for the queue-trigger listener
//!
//! Provides structured error handling and the behavioral classification the
//! poll loop needs to decide whether a storage failure is transient (reset
//! the existence cache and keep polling) or fatal (fault the listener).

use thiserror::Error;

/// Listener error types
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested queue does not exist
    #[error("Queue not found: {0}")]
    NotFound(String),

    /// The queue is being deleted or disabled and cannot currently serve requests
    #[error("Queue conflict (being deleted or disabled): {0}")]
    ConflictBeingDeletedOrDisabled(String),

    /// The queue service returned a 5xx-equivalent failure
    #[error("Queue service error: {0}")]
    ServerSideError(String),

    /// A message referenced by receipt no longer exists or the receipt is stale
    #[error("Message not found or receipt invalid: {0}")]
    MessageGone(String),

    /// The operation was cancelled cooperatively; never fatal
    #[error("Operation cancelled")]
    Cancelled,

    /// The listener has been disposed; no further calls are permitted
    #[error("Listener has been disposed")]
    Disposed,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ListenerError {
    pub fn invalid_config(details: impl Into<String>) -> Self {
        Self::InvalidConfig(details.into())
    }

    pub fn not_found(details: impl Into<String>) -> Self {
        Self::NotFound(details.into())
    }

    pub fn conflict(details: impl Into<String>) -> Self {
        Self::ConflictBeingDeletedOrDisabled(details.into())
    }

    pub fn server_side(details: impl Into<String>) -> Self {
        Self::ServerSideError(details.into())
    }

    pub fn message_gone(details: impl Into<String>) -> Self {
        Self::MessageGone(details.into())
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal(details.into())
    }

    /// `NotFound | ConflictBeingDeletedOrDisabled | ServerSideError`: reset
    /// the existence cache, treat the poll as empty, keep retrying. Never
    /// fatal to the listener.
    pub fn is_transient_storage(&self) -> bool {
        matches!(
            self,
            ListenerError::NotFound(_)
                | ListenerError::ConflictBeingDeletedOrDisabled(_)
                | ListenerError::ServerSideError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ListenerError::NotFound(_))
    }

    pub fn is_conflict_being_deleted_or_disabled(&self) -> bool {
        matches!(self, ListenerError::ConflictBeingDeletedOrDisabled(_))
    }

    pub fn is_server_side_error(&self) -> bool {
        matches!(self, ListenerError::ServerSideError(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ListenerError::Cancelled)
    }

    /// Terminal for a visibility renewer: the message was deleted or its
    /// receipt was superseded by a concurrent redelivery. The renewer stops
    /// without faulting the dispatcher.
    pub fn is_message_gone(&self) -> bool {
        matches!(self, ListenerError::MessageGone(_))
    }
}

/// Convenience result type for listener operations
pub type ListenerResult<T> = Result<T, ListenerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_storage_classification() {
        assert!(ListenerError::not_found("queue missing").is_transient_storage());
        assert!(ListenerError::conflict("being deleted").is_transient_storage());
        assert!(ListenerError::server_side("503").is_transient_storage());
        assert!(!ListenerError::invalid_config("bad batch size").is_transient_storage());
        assert!(!ListenerError::internal("unexpected").is_transient_storage());
    }

    #[test]
    fn test_is_cancelled() {
        assert!(ListenerError::Cancelled.is_cancelled());
        assert!(!ListenerError::Disposed.is_cancelled());
    }

    #[test]
    fn test_error_display() {
        let err = ListenerError::invalid_config("BATCH_SIZE must be > 0");
        assert_eq!(err.to_string(), "Invalid configuration: BATCH_SIZE must be > 0");
    }

    #[test]
    fn test_from_json_error() {
        let json_err: serde_json::Error = serde_json::from_str::<String>("invalid").unwrap_err();
        let listener_err: ListenerError = json_err.into();
        assert!(!listener_err.is_transient_storage());
        assert!(matches!(listener_err, ListenerError::Serialization(_)));
    }
}

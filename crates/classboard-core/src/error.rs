//! Collaboration errors.

use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised by the collaboration layer.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Join attempted with a code that is malformed or not registered.
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    /// No network path or backing store.
    #[error("Collaboration unavailable: {0}")]
    TransportUnavailable(String),
    /// Owner-only action attempted by someone else. Checked cooperatively.
    #[error("Not allowed: {0}")]
    AuthorizationDenied(String),
    #[error("Malformed payload: {0}")]
    Deserialization(String),
    #[error("Send failed: {0}")]
    SendFailure(String),
    #[error("The teacher has locked the canvas")]
    CanvasLocked,
    #[error("Not connected to a room")]
    NotConnected,
    #[error(transparent)]
    Storage(StorageError),
}

/// Result type for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

impl CollabError {
    /// Whether the initiating user should see this error. Deserialization and
    /// send failures are logged and swallowed instead.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            CollabError::Deserialization(_) | CollabError::SendFailure(_)
        )
    }

    /// Short actionable hint to show next to the message, if any.
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            CollabError::RoomNotFound(_) => Some("Check the room code with your teacher and try again."),
            CollabError::TransportUnavailable(_) => Some(
                "Set relay_url in collab.json or CLASSBOARD_RELAY_URL to a running classboard-relay (ws:// or wss://), or use direct mode on the same network.",
            ),
            CollabError::AuthorizationDenied(_) => Some("Only the teacher can do this."),
            CollabError::CanvasLocked => Some("Wait for the teacher to unlock the canvas."),
            CollabError::NotConnected => Some("Create or join a room first."),
            _ => None,
        }
    }
}

impl From<StorageError> for CollabError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => CollabError::TransportUnavailable(msg),
            other => CollabError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Deserialization(err.to_string())
    }
}

//! Error taxonomy for the synchronization core.
//!
//! Every variant is scoped to a single document: a failure on one document
//! never affects sessions of another.

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Operation needs an active session and none exists.
    #[error("No active session for document {0}")]
    UnknownDocument(Uuid),

    /// Store unreachable or snapshot corrupt while creating a session.
    /// Retryable; no session is created.
    #[error("Failed to hydrate document {doc_id}: {reason}")]
    Hydration { doc_id: Uuid, reason: String },

    /// Snapshot write failed. In-memory state and persisted version untouched.
    #[error("Failed to save document {doc_id}: {reason}")]
    Save { doc_id: Uuid, reason: String },

    /// The CRDT engine rejected an update. It was dropped, not broadcast.
    #[error("Rejected update for document {doc_id}: {reason}")]
    Merge { doc_id: Uuid, reason: String },

    #[error("Connection has not joined document {0}")]
    NotJoined(Uuid),

    #[error("Document {doc_id} already has {limit} peers")]
    RoomFull { doc_id: Uuid, limit: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Hydration { .. } | SyncError::Save { .. })
    }

    pub fn doc_id(&self) -> Option<Uuid> {
        match self {
            SyncError::UnknownDocument(id) | SyncError::NotJoined(id) => Some(*id),
            SyncError::Hydration { doc_id, .. }
            | SyncError::Save { doc_id, .. }
            | SyncError::Merge { doc_id, .. }
            | SyncError::RoomFull { doc_id, .. } => Some(*doc_id),
            SyncError::Protocol(_) => None,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let doc = Uuid::new_v4();
        assert!(SyncError::Hydration { doc_id: doc, reason: "x".into() }.is_retryable());
        assert!(SyncError::Save { doc_id: doc, reason: "x".into() }.is_retryable());
        assert!(!SyncError::Merge { doc_id: doc, reason: "x".into() }.is_retryable());
        assert!(!SyncError::UnknownDocument(doc).is_retryable());
    }

    #[test]
    fn test_doc_id_extraction() {
        let doc = Uuid::new_v4();
        assert_eq!(SyncError::NotJoined(doc).doc_id(), Some(doc));
        assert_eq!(SyncError::RoomFull { doc_id: doc, limit: 1 }.doc_id(), Some(doc));
        assert_eq!(SyncError::Protocol("bad".into()).doc_id(), None);
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: SyncError = ProtocolError::InvalidMessageType.into();
        assert!(matches!(err, SyncError::Protocol(ref m) if m.contains("Invalid message type")));
    }
}

//! Binary protocol for document room synchronization.
//!
//! Wire format (bincode-encoded, one message per WebSocket binary frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `seq` carries the per-document apply sequence on fanned-out updates and
//! the persisted snapshot version on `SaveAck`. It is zero elsewhere.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to attach to a document room
    Join = 1,
    /// Full state encoding, sent only to a joining client
    State = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Client asks for a durable snapshot
    SaveRequest = 4,
    /// Snapshot persisted; version in `seq`
    SaveAck = 5,
    /// Request-scoped failure
    Error = 6,
    /// Client detaches from a document room
    Leave = 7,
    /// Room notice: another peer attached
    PeerJoined = 8,
    /// Room notice: another peer detached
    PeerLeft = 9,
    /// Encoded state vector, asking for the missing diff
    SyncStep1 = 10,
    /// Diff response to `SyncStep1`
    SyncStep2 = 11,
    /// Heartbeat ping
    Ping = 12,
    /// Heartbeat pong
    Pong = 13,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Machine-readable error category sent back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownDocument,
    HydrationFailure,
    SaveFailure,
    MergeFailure,
    NotJoined,
    RoomFull,
    Protocol,
}

/// Payload of an `Error` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&SyncError> for ErrorBody {
    fn from(err: &SyncError) -> Self {
        let code = match err {
            SyncError::UnknownDocument(_) => ErrorCode::UnknownDocument,
            SyncError::Hydration { .. } => ErrorCode::HydrationFailure,
            SyncError::Save { .. } => ErrorCode::SaveFailure,
            SyncError::Merge { .. } => ErrorCode::MergeFailure,
            SyncError::NotJoined(_) => ErrorCode::NotJoined,
            SyncError::RoomFull { .. } => ErrorCode::RoomFull,
            SyncError::Protocol(_) => ErrorCode::Protocol,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn bare(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a join request carrying the peer's identity.
    pub fn join(doc_id: Uuid, info: &PeerInfo) -> Self {
        Self {
            payload: encode_body(info),
            ..Self::bare(MessageType::Join, info.peer_id, doc_id)
        }
    }

    /// Create a full-state reply for a joining client.
    pub fn state(doc_id: Uuid, full_state: Vec<u8>) -> Self {
        Self {
            payload: full_state,
            ..Self::bare(MessageType::State, Uuid::nil(), doc_id)
        }
    }

    /// Create an incremental update. Clients send `seq = 0`; the server
    /// stamps the apply sequence on the fanned-out copy.
    pub fn update(peer_id: Uuid, doc_id: Uuid, seq: u64, update: Vec<u8>) -> Self {
        Self {
            seq,
            payload: update,
            ..Self::bare(MessageType::Update, peer_id, doc_id)
        }
    }

    pub fn save_request(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::bare(MessageType::SaveRequest, peer_id, doc_id)
    }

    pub fn save_ack(doc_id: Uuid, version: u64) -> Self {
        Self {
            seq: version,
            ..Self::bare(MessageType::SaveAck, Uuid::nil(), doc_id)
        }
    }

    /// Create an error reply for a failed request.
    pub fn error(doc_id: Uuid, err: &SyncError) -> Self {
        Self {
            payload: encode_body(&ErrorBody::from(err)),
            ..Self::bare(MessageType::Error, Uuid::nil(), doc_id)
        }
    }

    pub fn leave(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::bare(MessageType::Leave, peer_id, doc_id)
    }

    /// Create a peer joined notice.
    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Self {
        Self {
            payload: encode_body(info),
            ..Self::bare(MessageType::PeerJoined, info.peer_id, doc_id)
        }
    }

    /// Create a peer left notice.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::bare(MessageType::PeerLeft, peer_id, doc_id)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            payload: state_vector,
            ..Self::bare(MessageType::SyncStep1, peer_id, doc_id)
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(doc_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self {
            payload: state_diff,
            ..Self::bare(MessageType::SyncStep2, Uuid::nil(), doc_id)
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Ping, peer_id, Uuid::nil())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Pong, peer_id, Uuid::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the peer identity of a `Join` or `PeerJoined` message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Join | MessageType::PeerJoined) {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_body(&self.payload)
    }

    /// Parse the body of an `Error` message.
    pub fn error_body(&self) -> Result<ErrorBody, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_body(&self.payload)
    }
}

fn encode_body<T: Serialize>(body: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(body, bincode::config::standard()).unwrap_or_default()
}

fn decode_body<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (body, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(body)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

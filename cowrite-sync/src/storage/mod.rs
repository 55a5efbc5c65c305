//! Durable snapshot storage for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────┐   put_snapshot    ┌──────────────────────┐
//! │ PersistenceCoordinator│ ────────────────► │ SnapshotStore        │
//! └──────────────────────┘                    │  ├─ MemoryStore      │
//! ┌──────────────────────┐  latest_snapshot   │  └─ RocksStore       │
//! │ SessionManager       │ ◄──────────────── │     CF "snapshots"   │
//! │ (hydration)          │                    │     CF "metadata"    │
//! └──────────────────────┘                    └──────────────────────┘
//! ```
//!
//! Snapshots are immutable once written. Versions per document form an
//! append-only, strictly increasing sequence.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// A durable, versioned encoding of one document's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub doc_id: Uuid,
    pub version: u64,
    pub payload: Vec<u8>,
    /// Seconds since the unix epoch
    pub created_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Version {attempted} for document {doc_id} is not newer than {latest}")]
    VersionConflict {
        doc_id: Uuid,
        attempted: u64,
        latest: u64,
    },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Document store collaborator.
///
/// Calls are blocking; async callers run them on the blocking pool.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Most recent snapshot of `doc_id`, if any was ever written.
    fn latest_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    /// Append a snapshot. `version` must exceed every stored version of
    /// `doc_id`; the write is all-or-nothing.
    fn put_snapshot(
        &self,
        doc_id: Uuid,
        version: u64,
        payload: &[u8],
    ) -> Result<Snapshot, StoreError>;

    /// All stored versions of `doc_id`, ascending.
    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<u64>, StoreError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

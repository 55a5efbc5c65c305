//! # cowrite-sync: Real-time document synchronization core
//!
//! Keeps one authoritative in-memory CRDT state per document, fans updates
//! out to every other client in the document's room, and persists
//! versioned snapshots through a pluggable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                  ┌─────────┴─────────┐
//!                                  │  SessionManager   │
//!                                  │  doc → session    │
//!                                  └──┬──────┬──────┬──┘
//!                        apply+fan-out│      │save  │idle
//!                                     ▼      ▼      ▼
//!                           BroadcastGroup Persistence Reaper
//!                                          Coordinator
//!                                              │
//!                                       SnapshotStore
//!                                    (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`engine`]: CRDT capability seam and the yrs implementation
//! - [`session`]: Session manager, single authority per document
//! - [`broadcast`]: Room fan-out, no echo, apply order preserved
//! - [`persistence`]: Snapshot saves with monotonically increasing versions
//! - [`lifecycle`]: Idle eviction
//! - [`storage`]: Snapshot stores (RocksDB + LZ4, in-memory)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod protocol;
pub mod error;
pub mod engine;
pub mod config;
pub mod broadcast;
pub mod session;
pub mod persistence;
pub mod lifecycle;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ErrorBody, ErrorCode, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use error::SyncError;
pub use engine::{CrdtEngine, EngineError, YrsEngine};
pub use config::{ConfigError, PersistenceConfig, ServerConfig, SessionConfig};
pub use broadcast::{BroadcastGroup, BroadcastStats, Subscription};
pub use session::{
    DocumentSession, JoinTicket, SessionHandle, SessionManager, SessionPhase, SessionStats,
};
pub use persistence::{FlushReport, PersistenceCoordinator, PersistenceStats, SaveCause};
pub use lifecycle::Reaper;
pub use storage::{
    DocumentMetadata, MemoryStore, RocksStore, Snapshot, SnapshotStore, StoreConfig, StoreError,
};
pub use server::{ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};

//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocumentSession (doc 1)
//!             ├── Connection ── Session ┤     CRDT state + BroadcastGroup
//! Client B ──┘       │        Manager  └── DocumentSession (doc 2)
//!                    │                          │
//!                    │            PersistenceCoordinator ── SnapshotStore
//!                    │                          │              (RocksDB / memory)
//!                    ▼                       Reaper
//!            forwarder per joined doc    (idle eviction)
//! ```
//!
//! One connection may join several documents. Each join spawns a forwarder
//! task that pumps the room subscription into the connection's outbound
//! queue; the connection loop writes both request replies and forwarded
//! room frames to the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Subscription;
use crate::config::ServerConfig;
use crate::engine::{CrdtEngine, YrsEngine};
use crate::error::SyncError;
use crate::lifecycle::Reaper;
use crate::persistence::{FlushReport, PersistenceCoordinator, SaveCause};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::session::SessionManager;
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Frames buffered per connection between forwarders and the socket.
const OUTBOUND_CAPACITY: usize = 256;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_requests: u64,
    pub active_sessions: usize,
    pub dirty_sessions: usize,
    pub snapshots_saved: u64,
    pub save_failures: u64,
}

/// The sync server.
pub struct SyncServer<E: CrdtEngine = YrsEngine> {
    config: ServerConfig,
    sessions: Arc<SessionManager<E>>,
    persistence: Arc<PersistenceCoordinator<E>>,
    reaper: Arc<Reaper<E>>,
    /// Connection-level counters
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Sender<bool>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncServer<YrsEngine> {
    /// Create a server from configuration.
    ///
    /// Opens a RocksDB store when `storage_path` is set, otherwise keeps
    /// snapshots in memory.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_engine(config, YrsEngine, store)
    }
}

impl<E: CrdtEngine> SyncServer<E> {
    pub fn with_engine(config: ServerConfig, engine: E, store: Arc<dyn SnapshotStore>) -> Self {
        let sessions = Arc::new(SessionManager::new(engine, store, config.session.clone()));
        let persistence = Arc::new(PersistenceCoordinator::new(sessions.clone()));
        let reaper = Arc::new(Reaper::new(
            sessions.clone(),
            persistence.clone(),
            &config.session,
            &config.persistence,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            sessions,
            persistence,
            reaper,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown,
            background: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.start_background_tasks();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
                    let connection = Connection {
                        addr,
                        sessions: self.sessions.clone(),
                        persistence: self.persistence.clone(),
                        stats: self.stats.clone(),
                        outbound,
                        joined: HashMap::new(),
                    };
                    let shutdown = self.shutdown.subscribe();

                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream, outbound_rx, shutdown).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    log::info!("Sync server stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }

    fn start_background_tasks(&self) {
        let Ok(mut background) = self.background.lock() else {
            return;
        };
        if !background.is_empty() {
            return;
        }

        background.push(self.reaper.clone().spawn(self.config.session.sweep_interval));
        if let Some(interval) = self.config.persistence.autosave_interval {
            background.push(self.persistence.clone().spawn_autosave(interval));
        }
    }

    /// Stop accepting connections, disconnect clients and stop background
    /// tasks. Dirty documents are saved when `save_on_shutdown` is set.
    pub async fn shutdown(&self) -> FlushReport {
        self.shutdown.send_replace(true);

        if let Ok(mut background) = self.background.lock() {
            for task in background.drain(..) {
                task.abort();
            }
        }

        if !self.config.persistence.save_on_shutdown {
            let dirty = self.sessions.dirty_documents().await;
            if !dirty.is_empty() {
                log::warn!("Shutting down with {} unsaved documents", dirty.len());
            }
            return FlushReport::default();
        }

        let report = self.persistence.flush_all(SaveCause::Shutdown).await;
        log::info!(
            "Shutdown flush: {} saved, {} failed",
            report.saved.len(),
            report.failed.len()
        );
        report
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let sessions = self.sessions.stats().await;
        let persistence = self.persistence.stats();
        stats.active_sessions = sessions.active_sessions;
        stats.dirty_sessions = sessions.dirty_sessions;
        stats.snapshots_saved = persistence.saves_completed;
        stats.save_failures = persistence.saves_failed;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager<E>> {
        &self.sessions
    }

    pub fn persistence(&self) -> &Arc<PersistenceCoordinator<E>> {
        &self.persistence
    }

    pub fn reaper(&self) -> &Arc<Reaper<E>> {
        &self.reaper
    }
}

/// A document this connection has joined.
struct Joined {
    /// Room-assigned id of this connection's membership
    member_id: Uuid,
    forwarder: JoinHandle<()>,
}

/// Per-socket state.
struct Connection<E: CrdtEngine> {
    addr: SocketAddr,
    sessions: Arc<SessionManager<E>>,
    persistence: Arc<PersistenceCoordinator<E>>,
    stats: Arc<RwLock<ServerStats>>,
    outbound: mpsc::Sender<Vec<u8>>,
    joined: HashMap<Uuid, Joined>,
}

impl<E: CrdtEngine> Connection<E> {
    async fn run(
        mut self,
        stream: TcpStream,
        outbound_rx: mpsc::Receiver<Vec<u8>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.pump(ws_stream, outbound_rx, shutdown).await;

        // Membership ends with the socket, however it ended
        self.release_all().await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection closed from {}", self.addr);
        result
    }

    async fn pump(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut outbound_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if let Some(reply) = self.handle_frame(&bytes).await {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                        _ => {}
                    }
                }

                // Room frames from this connection's forwarders
                Some(frame) = outbound_rx.recv() => {
                    ws_sender.send(Message::Binary(frame.into())).await?;
                }

                _ = shutdown.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle one client frame; returns the encoded reply, if any.
    async fn handle_frame(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", self.addr);
                return None;
            }
        };

        let doc_id = msg.doc_id;
        let reply = match self.dispatch(msg).await {
            Ok(reply) => reply?,
            Err(e) => {
                log::warn!("Request from {} failed: {e}", self.addr);
                self.stats.write().await.rejected_requests += 1;
                SyncMessage::error(doc_id, &e)
            }
        };

        match reply.encode() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                log::error!("Failed to encode reply for {}: {e}", self.addr);
                None
            }
        }
    }

    async fn dispatch(&mut self, msg: SyncMessage) -> Result<Option<SyncMessage>, SyncError> {
        let doc_id = msg.doc_id;
        match msg.msg_type {
            MessageType::Join => {
                let info = msg
                    .peer_info()
                    .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));
                self.join(doc_id, info).await.map(Some)
            }

            MessageType::Update => {
                let from = self
                    .joined
                    .get(&doc_id)
                    .map(|joined| joined.member_id)
                    .ok_or(SyncError::NotJoined(doc_id))?;
                self.sessions
                    .apply_remote_update(doc_id, &msg.payload, from)
                    .await?;
                Ok(None)
            }

            MessageType::SaveRequest => {
                let version = self.persistence.save_now(doc_id).await?;
                Ok(Some(SyncMessage::save_ack(doc_id, version)))
            }

            MessageType::Leave => {
                let joined = self
                    .joined
                    .remove(&doc_id)
                    .ok_or(SyncError::NotJoined(doc_id))?;
                joined.forwarder.abort();
                self.sessions.release(doc_id, joined.member_id).await?;
                Ok(None)
            }

            MessageType::SyncStep1 => {
                let diff = self.sessions.encode_diff(doc_id, &msg.payload).await?;
                Ok(Some(SyncMessage::sync_step2(doc_id, diff)))
            }

            MessageType::Ping => Ok(Some(SyncMessage::pong(msg.peer_id))),

            other => Err(SyncError::Protocol(format!(
                "{other:?} is not a client request"
            ))),
        }
    }

    async fn join(&mut self, doc_id: Uuid, info: PeerInfo) -> Result<SyncMessage, SyncError> {
        if let Some(previous) = self.joined.remove(&doc_id) {
            previous.forwarder.abort();
            let _ = self.sessions.release(doc_id, previous.member_id).await;
        }

        let ticket = self.sessions.join(doc_id, info).await?;
        // Forwarded frames queue behind the state reply returned here
        let forwarder = spawn_forwarder(
            ticket.subscription,
            self.outbound.clone(),
            self.sessions.clone(),
        );
        self.joined.insert(
            doc_id,
            Joined {
                member_id: ticket.member_id,
                forwarder,
            },
        );

        Ok(SyncMessage::state(doc_id, ticket.state))
    }

    async fn release_all(&mut self) {
        for (doc_id, joined) in self.joined.drain() {
            joined.forwarder.abort();
            if let Err(e) = self.sessions.release(doc_id, joined.member_id).await {
                log::debug!("Release of member {} from doc {doc_id} skipped: {e}", joined.member_id);
            }
        }
    }
}

/// Pump a room subscription into a connection's outbound queue.
///
/// A subscription that fell behind its buffer is resynchronised with a
/// fresh full state; merging is idempotent, so overlap is harmless.
fn spawn_forwarder<E: CrdtEngine>(
    mut subscription: Subscription,
    outbound: mpsc::Sender<Vec<u8>>,
    sessions: Arc<SessionManager<E>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let doc_id = subscription.doc_id();
        loop {
            let frame = match subscription.recv().await {
                Ok(frame) => frame.to_vec(),
                Err(RecvError::Lagged(n)) => {
                    log::warn!(
                        "Member {} lagged by {n} frames on doc {doc_id}; resending state",
                        subscription.member_id()
                    );
                    let resync = sessions
                        .encode_full_state(doc_id)
                        .await
                        .and_then(|state| {
                            SyncMessage::state(doc_id, state)
                                .encode()
                                .map_err(SyncError::from)
                        });
                    match resync {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Resync of doc {doc_id} failed: {e}");
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            };

            if outbound.send(frame).await.is_err() {
                break;
            }
        }
    })
}

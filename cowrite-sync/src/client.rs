//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Join/leave of any number of document rooms over one connection
//! - Update send/receive, save requests and state-vector catch-up
//!
//! The client does not hold CRDT state itself; applications merge the
//! payloads of [`SyncEvent`]s into their own replica.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ErrorBody, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Full state of a joined document (join reply, or resync after lag)
    State { doc_id: Uuid, state: Vec<u8> },
    /// Update applied by the server on behalf of another peer
    RemoteUpdate {
        doc_id: Uuid,
        peer_id: Uuid,
        seq: u64,
        update: Vec<u8>,
    },
    /// Snapshot persisted
    SaveAck { doc_id: Uuid, version: u64 },
    /// A request failed
    Error { doc_id: Uuid, error: ErrorBody },
    /// A peer joined a document
    PeerJoined { doc_id: Uuid, peer: PeerInfo },
    /// A peer left a document
    PeerLeft { doc_id: Uuid, peer_id: Uuid },
    /// Diff answering a state vector
    StateSynced { doc_id: Uuid, diff: Vec<u8> },
    Pong,
}

/// The sync client.
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    tasks: Vec<JoinHandle<()>>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: turn incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if let Some(event) = to_event(sync_msg) {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Attach to a document room. The server answers with `SyncEvent::State`.
    pub async fn join(&self, doc_id: Uuid) -> Result<(), ProtocolError> {
        self.send(SyncMessage::join(doc_id, &self.peer_info)).await
    }

    /// Send a CRDT update for a joined document.
    pub async fn send_update(&self, doc_id: Uuid, update: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::update(self.peer_info.peer_id, doc_id, 0, update))
            .await
    }

    /// Ask the server to persist a snapshot. Answered by `SyncEvent::SaveAck`.
    pub async fn request_save(&self, doc_id: Uuid) -> Result<(), ProtocolError> {
        self.send(SyncMessage::save_request(self.peer_info.peer_id, doc_id))
            .await
    }

    pub async fn leave(&self, doc_id: Uuid) -> Result<(), ProtocolError> {
        self.send(SyncMessage::leave(self.peer_info.peer_id, doc_id))
            .await
    }

    /// Ask for everything missing from a replica with `state_vector`.
    pub async fn sync_step1(&self, doc_id: Uuid, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step1(self.peer_info.peer_id, doc_id, state_vector))
            .await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    /// Close the connection and stop background tasks.
    pub async fn disconnect(&mut self) {
        // Dropping the sender lets the writer close the socket
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get our peer info.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
    let doc_id = msg.doc_id;
    let event = match msg.msg_type {
        MessageType::State => SyncEvent::State {
            doc_id,
            state: msg.payload,
        },
        MessageType::Update => SyncEvent::RemoteUpdate {
            doc_id,
            peer_id: msg.peer_id,
            seq: msg.seq,
            update: msg.payload,
        },
        MessageType::SaveAck => SyncEvent::SaveAck {
            doc_id,
            version: msg.seq,
        },
        MessageType::Error => SyncEvent::Error {
            doc_id,
            error: msg.error_body().ok()?,
        },
        MessageType::PeerJoined => SyncEvent::PeerJoined {
            doc_id,
            peer: msg.peer_info().ok()?,
        },
        MessageType::PeerLeft => SyncEvent::PeerLeft {
            doc_id,
            peer_id: msg.peer_id,
        },
        MessageType::SyncStep2 => SyncEvent::StateSynced {
            doc_id,
            diff: msg.payload,
        },
        MessageType::Pong => SyncEvent::Pong,
        other => {
            log::debug!("Ignoring {other:?} from server");
            return None;
        }
    };
    Some(event)
}

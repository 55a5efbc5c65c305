//! Session manager: the single in-memory authority per document.
//!
//! ```text
//!                   sessions: doc_id → slot
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                    ▼
//!     OnceCell (Loading)   DocumentSession      DocumentSession
//!          │               ├─ state lock ──► CRDT state + room + versions
//!          │               └─ save lock  ──► one save in flight per doc
//!          └─ hydrate from latest snapshot, exactly once
//! ```
//!
//! All reads and writes of one document's CRDT state happen under that
//! document's state lock, and the room broadcast of an applied update
//! happens under the same lock: apply order equals delivery order.
//! Different documents never share a lock.
//!
//! Lock order: the session map lock is never held while waiting for a state
//! lock. Eviction holds a state lock while taking the map lock, and only
//! ever `try_lock`s the save lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Subscription};
use crate::config::SessionConfig;
use crate::engine::CrdtEngine;
use crate::error::SyncError;
use crate::protocol::{PeerInfo, SyncMessage};
use crate::storage::SnapshotStore;

pub type SessionHandle<E> = Arc<DocumentSession<E>>;

type Slot<E> = Arc<OnceCell<SessionHandle<E>>>;

/// Lifecycle phase of a document in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Hydration from the store in progress
    Loading,
    /// At least one member attached
    Active,
    /// No members; eviction pending once the grace period passes
    Idle,
    /// Not in memory (never loaded, or evicted)
    Evicted,
}

/// Mutable per-document state, guarded by the document's state lock.
pub(crate) struct SessionState<S> {
    pub(crate) crdt: S,
    pub(crate) room: BroadcastGroup,
    pub(crate) last_activity: Instant,
    /// Version of the most recent durable snapshot
    pub(crate) last_persisted_version: Option<u64>,
    /// Number of updates applied since this session was created
    pub(crate) applied_seq: u64,
    /// `applied_seq` captured by the most recent successful save
    pub(crate) persisted_seq: u64,
    /// The store holds history this session never loaded; saves are refused
    pub(crate) history_conflict: bool,
    pub(crate) evicted: bool,
}

impl<S> SessionState<S> {
    pub(crate) fn is_dirty(&self) -> bool {
        self.applied_seq > self.persisted_seq
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// One document's live collaborative state.
pub struct DocumentSession<E: CrdtEngine> {
    doc_id: Uuid,
    pub(crate) state: Mutex<SessionState<E::State>>,
    pub(crate) save_lock: Mutex<()>,
}

impl<E: CrdtEngine> DocumentSession<E> {
    fn new(doc_id: Uuid, crdt: E::State, persisted: Option<u64>, capacity: usize) -> Self {
        Self {
            doc_id,
            state: Mutex::new(SessionState {
                crdt,
                room: BroadcastGroup::new(doc_id, capacity),
                last_activity: Instant::now(),
                last_persisted_version: persisted,
                applied_seq: 0,
                persisted_seq: 0,
                history_conflict: false,
                evicted: false,
            }),
            save_lock: Mutex::new(()),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub async fn last_persisted_version(&self) -> Option<u64> {
        self.state.lock().await.last_persisted_version
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.room.peer_count()
    }

    pub async fn last_activity(&self) -> Instant {
        self.state.lock().await.last_activity
    }

    /// Whether updates were applied since the last successful save.
    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.is_dirty()
    }
}

/// What a joining client receives.
pub struct JoinTicket {
    /// Server-assigned membership key: the update origin and release key
    pub member_id: Uuid,
    /// Room frames broadcast after the state below was encoded
    pub subscription: Subscription,
    /// Full state encoding at the moment of joining
    pub state: Vec<u8>,
}

/// Aggregate counters over all sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub loading_sessions: usize,
    pub total_members: usize,
    pub dirty_sessions: usize,
}

/// Owns every in-memory document session.
pub struct SessionManager<E: CrdtEngine> {
    engine: E,
    store: Arc<dyn SnapshotStore>,
    config: SessionConfig,
    sessions: RwLock<HashMap<Uuid, Slot<E>>>,
}

impl<E: CrdtEngine> SessionManager<E> {
    pub fn new(engine: E, store: Arc<dyn SnapshotStore>, config: SessionConfig) -> Self {
        Self {
            engine,
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return the live session for `doc_id`, creating and hydrating it from
    /// the latest snapshot on first use.
    ///
    /// Concurrent callers for the same document wait on one hydration. If
    /// hydration fails no session is created and the error is retryable.
    pub async fn acquire(&self, doc_id: Uuid) -> Result<SessionHandle<E>, SyncError> {
        let slot = self.slot(doc_id).await;
        match slot.get_or_try_init(|| self.hydrate(doc_id)).await {
            Ok(session) => Ok(session.clone()),
            Err(e) => {
                self.discard_failed_slot(doc_id, &slot).await;
                Err(e)
            }
        }
    }

    /// The live session for `doc_id`, without creating one.
    pub async fn get(&self, doc_id: Uuid) -> Option<SessionHandle<E>> {
        let sessions = self.sessions.read().await;
        sessions.get(&doc_id).and_then(|slot| slot.get().cloned())
    }

    /// Attach a peer to a document room.
    ///
    /// Membership, subscription and full-state encoding happen under one
    /// state lock, so the subscription starts exactly where the returned
    /// state ends. Every join is a new member, even for a `PeerInfo` that is
    /// already in the room.
    pub async fn join(&self, doc_id: Uuid, peer: PeerInfo) -> Result<JoinTicket, SyncError> {
        loop {
            let session = self.acquire(doc_id).await?;
            let mut state = session.state.lock().await;
            if state.evicted {
                // Lost a race with the reaper; load a fresh session
                continue;
            }

            let limit = self.config.max_peers_per_room;
            if state.room.peer_count() >= limit {
                return Err(SyncError::RoomFull { doc_id, limit });
            }

            let name = peer.name.clone();
            let peer_id = peer.peer_id;
            let subscription = state.room.join(peer);
            let member_id = subscription.member_id();
            let full_state = self.engine.encode_state(&state.crdt);
            state.touch();

            log::info!(
                "Peer {name} ({peer_id}) joined doc {doc_id} ({} members)",
                state.room.peer_count()
            );

            return Ok(JoinTicket {
                member_id,
                subscription,
                state: full_state,
            });
        }
    }

    /// Merge a client's update and fan it out to the other members.
    ///
    /// `from` is the sender's member id; the fanned-out frame carries the
    /// member's display peer id. Returns the per-document apply sequence
    /// number. A rejected update is neither applied nor broadcast.
    pub async fn apply_remote_update(
        &self,
        doc_id: Uuid,
        update: &[u8],
        from: Uuid,
    ) -> Result<u64, SyncError> {
        let session = self
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        let mut guard = session.state.lock().await;
        if guard.evicted {
            return Err(SyncError::UnknownDocument(doc_id));
        }
        let state = &mut *guard;

        self.engine.merge(&mut state.crdt, update).map_err(|e| {
            log::warn!("Dropping update from {from} for doc {doc_id}: {e}");
            SyncError::Merge {
                doc_id,
                reason: e.to_string(),
            }
        })?;

        state.applied_seq += 1;
        let seq = state.applied_seq;
        state.touch();

        let author = state.room.member(&from).map_or(from, |info| info.peer_id);
        let msg = SyncMessage::update(author, doc_id, seq, update.to_vec());
        match state.room.on_update(from, &msg) {
            Ok(receivers) => {
                log::trace!("Update #{seq} on doc {doc_id} fanned out to {receivers} subscriptions")
            }
            // Already applied; peers catch up through full state on rejoin
            Err(e) => log::error!("Failed to broadcast update #{seq} on doc {doc_id}: {e}"),
        }

        Ok(seq)
    }

    /// Complete encoding of the current state of `doc_id`.
    pub async fn encode_full_state(&self, doc_id: Uuid) -> Result<Vec<u8>, SyncError> {
        let session = self
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        let state = session.state.lock().await;
        if state.evicted {
            return Err(SyncError::UnknownDocument(doc_id));
        }
        Ok(self.engine.encode_state(&state.crdt))
    }

    /// Incremental update for a peer that has observed `state_vector`.
    pub async fn encode_diff(&self, doc_id: Uuid, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let session = self
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        let state = session.state.lock().await;
        if state.evicted {
            return Err(SyncError::UnknownDocument(doc_id));
        }
        self.engine
            .encode_diff(&state.crdt, state_vector)
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    /// Detach the member `member_id`. When the room empties the idle
    /// countdown starts.
    ///
    /// Returns whether it was a member.
    pub async fn release(&self, doc_id: Uuid, member_id: Uuid) -> Result<bool, SyncError> {
        let session = self
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        let mut state = session.state.lock().await;
        let removed = state.room.leave(&member_id);
        state.touch();

        if let Some(peer) = &removed {
            log::info!("Peer {} ({}) left doc {doc_id}", peer.name, peer.peer_id);
        }
        let removed = removed.is_some();
        if state.room.is_empty() {
            log::debug!(
                "Doc {doc_id} idle; eligible for eviction in {:?}",
                self.config.idle_grace
            );
        }
        Ok(removed)
    }

    /// Mark `doc_id` as recently used.
    pub async fn touch(&self, doc_id: Uuid) -> Result<(), SyncError> {
        let session = self
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        session.state.lock().await.touch();
        Ok(())
    }

    pub async fn phase(&self, doc_id: Uuid) -> SessionPhase {
        // Only acquirers hold slot clones; a failed hydration relies on that
        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(&doc_id) {
                Some(slot) => match slot.get() {
                    Some(session) => session.clone(),
                    None => return SessionPhase::Loading,
                },
                None => return SessionPhase::Evicted,
            }
        };
        let state = session.state.lock().await;
        if state.evicted {
            SessionPhase::Evicted
        } else if state.room.is_empty() {
            SessionPhase::Idle
        } else {
            SessionPhase::Active
        }
    }

    /// Members currently attached to `doc_id`.
    pub async fn members(&self, doc_id: Uuid) -> Vec<PeerInfo> {
        match self.get(doc_id).await {
            Some(session) => session.state.lock().await.room.peers(),
            None => Vec::new(),
        }
    }

    /// Every fully loaded session.
    pub async fn sessions(&self) -> Vec<SessionHandle<E>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Documents with updates applied since their last successful save.
    pub async fn dirty_documents(&self) -> Vec<Uuid> {
        let mut dirty = Vec::new();
        for session in self.sessions().await {
            let state = session.state.lock().await;
            if !state.evicted && state.is_dirty() {
                dirty.push(session.doc_id());
            }
        }
        dirty
    }

    /// Memberless sessions idle for at least `grace`, with their dirty flag.
    pub async fn idle_candidates(&self, grace: Duration) -> Vec<(Uuid, bool)> {
        let mut idle = Vec::new();
        for session in self.sessions().await {
            let state = session.state.lock().await;
            if !state.evicted && state.room.is_empty() && state.last_activity.elapsed() >= grace {
                idle.push((session.doc_id(), state.is_dirty()));
            }
        }
        idle
    }

    /// Whether saves of `doc_id` were refused because the store holds
    /// history this session never loaded.
    pub async fn has_history_conflict(&self, doc_id: Uuid) -> bool {
        match self.get(doc_id).await {
            Some(session) => session.state.lock().await.history_conflict,
            None => false,
        }
    }

    /// Remove `doc_id` from memory if it is still idle.
    ///
    /// Every condition is re-checked under the state lock: no members, idle
    /// for `grace`, no save in flight and, when `require_clean`, nothing
    /// unsaved. A session with a history conflict can never be saved, so
    /// `require_clean` does not hold it. Returns whether the session was
    /// evicted.
    pub async fn try_evict(&self, doc_id: Uuid, grace: Duration, require_clean: bool) -> bool {
        let Some(session) = self.get(doc_id).await else {
            return false;
        };
        let mut state = session.state.lock().await;
        if state.evicted || !state.room.is_empty() || state.last_activity.elapsed() < grace {
            return false;
        }
        if require_clean && state.is_dirty() && !state.history_conflict {
            return false;
        }
        let Ok(_no_save_in_flight) = session.save_lock.try_lock() else {
            return false;
        };

        state.evicted = true;
        let unsaved = state.is_dirty();

        let mut sessions = self.sessions.write().await;
        let is_current = sessions
            .get(&doc_id)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, &session));
        if is_current {
            sessions.remove(&doc_id);
        }

        if unsaved {
            log::warn!(
                "Evicted doc {doc_id} with {} unsaved updates",
                state.applied_seq - state.persisted_seq
            );
        } else {
            log::info!("Evicted idle doc {doc_id}");
        }
        true
    }

    pub async fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        let loaded: Vec<SessionHandle<E>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter_map(|slot| {
                    let session = slot.get().cloned();
                    if session.is_none() {
                        stats.loading_sessions += 1;
                    }
                    session
                })
                .collect()
        };
        for session in loaded {
            let state = session.state.lock().await;
            if state.evicted {
                continue;
            }
            stats.active_sessions += 1;
            stats.total_members += state.room.peer_count();
            if state.is_dirty() {
                stats.dirty_sessions += 1;
            }
        }
        stats
    }

    async fn slot(&self, doc_id: Uuid) -> Slot<E> {
        if let Some(slot) = self.sessions.read().await.get(&doc_id) {
            return slot.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(doc_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Drop a slot whose hydration failed, unless another caller is still
    /// waiting on it (that caller will retry the hydration itself).
    async fn discard_failed_slot(&self, doc_id: Uuid, slot: &Slot<E>) {
        let mut sessions = self.sessions.write().await;
        let unused = sessions.get(&doc_id).is_some_and(|current| {
            // Clones are only handed out under the map lock: map + caller
            Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(current) == 2
        });
        if unused {
            sessions.remove(&doc_id);
        }
    }

    async fn hydrate(&self, doc_id: Uuid) -> Result<SessionHandle<E>, SyncError> {
        let (crdt, persisted) = match self.load_latest(doc_id).await {
            Ok(loaded) => loaded,
            Err(e) if self.config.skip_failed_hydration => {
                log::warn!("{e}; starting doc {doc_id} from empty state");
                (self.engine.new_state(), None)
            }
            Err(e) => {
                log::error!("{e}");
                return Err(e);
            }
        };

        Ok(Arc::new(DocumentSession::new(
            doc_id,
            crdt,
            persisted,
            self.config.broadcast_capacity,
        )))
    }

    async fn load_latest(&self, doc_id: Uuid) -> Result<(E::State, Option<u64>), SyncError> {
        let hydration_failure = |reason: String| SyncError::Hydration { doc_id, reason };

        let store = self.store.clone();
        let latest = tokio::task::spawn_blocking(move || store.latest_snapshot(doc_id))
            .await
            .map_err(|e| hydration_failure(e.to_string()))?
            .map_err(|e| hydration_failure(e.to_string()))?;

        let mut crdt = self.engine.new_state();
        match latest {
            Some(snapshot) => {
                self.engine
                    .merge(&mut crdt, &snapshot.payload)
                    .map_err(|e| {
                        hydration_failure(format!("corrupt snapshot v{}: {e}", snapshot.version))
                    })?;
                log::info!(
                    "Loaded doc {doc_id} from snapshot v{} ({} bytes)",
                    snapshot.version,
                    snapshot.payload.len()
                );
                Ok((crdt, Some(snapshot.version)))
            }
            None => {
                log::info!("Created empty session for doc {doc_id}");
                Ok((crdt, None))
            }
        }
    }
}

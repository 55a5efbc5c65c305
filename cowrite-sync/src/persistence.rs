//! Persistence coordinator: turns live session state into durable snapshots.
//!
//! A save encodes the full state under the document's state lock, then
//! writes it outside that lock so merging continues while the store works.
//! Saves of one document are serialized by its save lock; the version is
//! derived from the last persisted one, so versions strictly increase.
//!
//! A store that already holds a version this session never loaded refuses
//! every save of it. The session is then marked as conflicting and can be
//! evicted without a final save.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::engine::CrdtEngine;
use crate::error::SyncError;
use crate::session::SessionManager;
use crate::storage::{SnapshotStore, StoreError};

/// Why a snapshot is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveCause {
    /// A client's `SaveRequest`
    Request,
    /// Periodic autosave
    Autosave,
    /// Final save before eviction
    Eviction,
    /// Graceful shutdown
    Shutdown,
}

impl SaveCause {
    /// Eviction saves leave the idle clock alone.
    fn counts_as_activity(self) -> bool {
        !matches!(self, SaveCause::Eviction)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub saves_completed: u64,
    pub saves_failed: u64,
}

/// Outcome of saving every dirty document.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Documents saved, with the version written
    pub saved: Vec<(Uuid, u64)>,
    pub failed: Vec<(Uuid, SyncError)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct PersistenceCoordinator<E: CrdtEngine> {
    sessions: Arc<SessionManager<E>>,
    store: Arc<dyn SnapshotStore>,
    saves_completed: AtomicU64,
    saves_failed: AtomicU64,
}

impl<E: CrdtEngine> PersistenceCoordinator<E> {
    pub fn new(sessions: Arc<SessionManager<E>>) -> Self {
        let store = sessions.store().clone();
        Self {
            sessions,
            store,
            saves_completed: AtomicU64::new(0),
            saves_failed: AtomicU64::new(0),
        }
    }

    /// Persist the current state of `doc_id` as a new snapshot version.
    ///
    /// Returns the version written. Saving twice without intervening updates
    /// writes two versions with identical payloads. On failure neither the
    /// in-memory state nor the persisted version changes.
    pub async fn save_now(&self, doc_id: Uuid) -> Result<u64, SyncError> {
        self.save(doc_id, SaveCause::Request).await
    }

    /// Save only if updates were applied since the last successful save.
    pub async fn save_if_dirty(&self, doc_id: Uuid, cause: SaveCause) -> Result<Option<u64>, SyncError> {
        let session = self
            .sessions
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        if !session.is_dirty().await {
            return Ok(None);
        }
        self.save(doc_id, cause).await.map(Some)
    }

    pub async fn save(&self, doc_id: Uuid, cause: SaveCause) -> Result<u64, SyncError> {
        let session = self
            .sessions
            .get(doc_id)
            .await
            .ok_or(SyncError::UnknownDocument(doc_id))?;
        let _saving = session.save_lock.lock().await;

        let (payload, seq, version) = {
            let state = session.state.lock().await;
            if state.evicted {
                return Err(SyncError::UnknownDocument(doc_id));
            }
            let version = state.last_persisted_version.map_or(1, |v| v + 1);
            (
                self.sessions.engine().encode_state(&state.crdt),
                state.applied_seq,
                version,
            )
        };

        let size = payload.len();
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.put_snapshot(doc_id, version, &payload)).await;

        let snapshot = match written {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                if let StoreError::VersionConflict { latest, .. } = &e {
                    let mut state = session.state.lock().await;
                    if !state.history_conflict {
                        state.history_conflict = true;
                        log::warn!(
                            "Doc {doc_id} has stored history up to v{latest} that was never \
                             loaded; its edits cannot be saved"
                        );
                    }
                }
                return Err(self.save_failed(doc_id, version, cause, e.to_string()));
            }
            Err(e) => return Err(self.save_failed(doc_id, version, cause, e.to_string())),
        };

        let mut state = session.state.lock().await;
        state.last_persisted_version = Some(snapshot.version);
        state.persisted_seq = state.persisted_seq.max(seq);
        if cause.counts_as_activity() {
            state.touch();
        }
        drop(state);

        self.saves_completed.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Saved doc {doc_id} as v{} ({size} bytes, {cause:?})",
            snapshot.version
        );
        Ok(snapshot.version)
    }

    fn save_failed(&self, doc_id: Uuid, version: u64, cause: SaveCause, reason: String) -> SyncError {
        self.saves_failed.fetch_add(1, Ordering::Relaxed);
        log::error!("Failed to save doc {doc_id} v{version} ({cause:?}): {reason}");
        SyncError::Save { doc_id, reason }
    }

    /// Save every dirty document. Failures are collected, not fatal.
    pub async fn flush_all(&self, cause: SaveCause) -> FlushReport {
        let mut report = FlushReport::default();
        for doc_id in self.sessions.dirty_documents().await {
            match self.save(doc_id, cause).await {
                Ok(version) => report.saved.push((doc_id, version)),
                // Evicted between listing and saving
                Err(SyncError::UnknownDocument(_)) => {}
                Err(e) => report.failed.push((doc_id, e)),
            }
        }
        report
    }

    /// Periodically save dirty documents.
    pub fn spawn_autosave(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            log::info!("Autosave every {interval:?}");

            loop {
                ticker.tick().await;
                let report = self.flush_all(SaveCause::Autosave).await;
                if !report.saved.is_empty() || !report.failed.is_empty() {
                    log::debug!(
                        "Autosave: {} saved, {} failed",
                        report.saved.len(),
                        report.failed.len()
                    );
                }
            }
        })
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            saves_completed: self.saves_completed.load(Ordering::Relaxed),
            saves_failed: self.saves_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::engine::YrsEngine;
    use crate::protocol::PeerInfo;
    use crate::session::SessionPhase;
    use crate::storage::MemoryStore;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    fn setup() -> (
        Arc<MemoryStore>,
        Arc<SessionManager<YrsEngine>>,
        PersistenceCoordinator<YrsEngine>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(
            YrsEngine,
            store.clone(),
            SessionConfig::default(),
        ));
        let persistence = PersistenceCoordinator::new(sessions.clone());
        (store, sessions, persistence)
    }

    fn text_update(content: &str) -> Vec<u8> {
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    fn text_of(state: &[u8]) -> String {
        let mut doc = YrsEngine.new_state();
        YrsEngine.merge(&mut doc, state).unwrap();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn test_save_unknown_document() {
        let (_, _, persistence) = setup();
        let doc = Uuid::new_v4();
        let err = persistence.save_now(doc).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownDocument(id) if id == doc));
    }

    #[tokio::test]
    async fn test_first_save_is_version_one() {
        let (store, sessions, persistence) = setup();
        let doc = Uuid::new_v4();
        sessions.acquire(doc).await.unwrap();
        sessions
            .apply_remote_update(doc, &text_update("hello"), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(persistence.save_now(doc).await.unwrap(), 1);
        let snapshot = store.latest_snapshot(doc).unwrap().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(text_of(&snapshot.payload), "hello");
        assert!(!sessions.get(doc).await.unwrap().is_dirty().await);
    }

    #[tokio::test]
    async fn test_repeated_save_increments_version_same_payload() {
        let (store, sessions, persistence) = setup();
        let doc = Uuid::new_v4();
        sessions.acquire(doc).await.unwrap();
        sessions
            .apply_remote_update(doc, &text_update("same"), Uuid::new_v4())
            .await
            .unwrap();

        let v1 = persistence.save_now(doc).await.unwrap();
        let v2 = persistence.save_now(doc).await.unwrap();
        assert!(v2 > v1);
        assert_eq!(
            store.snapshot(doc, v1).unwrap().payload,
            store.snapshot(doc, v2).unwrap().payload
        );
    }

    #[tokio::test]
    async fn test_version_continues_after_hydration() {
        let (store, sessions, persistence) = setup();
        let doc = Uuid::new_v4();
        store.put_snapshot(doc, 7, &text_update("seed")).unwrap();

        sessions.acquire(doc).await.unwrap();
        assert_eq!(persistence.save_now(doc).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_state_untouched() {
        let (store, sessions, persistence) = setup();
        let doc = Uuid::new_v4();
        let session = sessions.acquire(doc).await.unwrap();
        sessions
            .apply_remote_update(doc, &text_update("keep"), Uuid::new_v4())
            .await
            .unwrap();
        persistence.save_now(doc).await.unwrap();
        sessions
            .apply_remote_update(doc, &text_update("more"), Uuid::new_v4())
            .await
            .unwrap();
        let before = sessions.encode_full_state(doc).await.unwrap();

        store.set_unavailable(true);
        let err = persistence.save_now(doc).await.unwrap_err();
        assert!(matches!(err, SyncError::Save { .. }));
        assert!(err.is_retryable());
        assert_eq!(session.last_persisted_version().await, Some(1));
        assert!(session.is_dirty().await);
        assert_eq!(sessions.encode_full_state(doc).await.unwrap(), before);
        assert_eq!(persistence.stats().saves_failed, 1);

        // Retry picks up the version the failed attempt would have used
        store.set_unavailable(false);
        assert_eq!(persistence.save_now(doc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_save_if_dirty_skips_clean_sessions() {
        let (store, sessions, persistence) = setup();
        let doc = Uuid::new_v4();
        sessions.acquire(doc).await.unwrap();

        assert_eq!(persistence.save_if_dirty(doc, SaveCause::Autosave).await.unwrap(), None);
        sessions
            .apply_remote_update(doc, &text_update("x"), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(
            persistence.save_if_dirty(doc, SaveCause::Autosave).await.unwrap(),
            Some(1)
        );
        assert_eq!(store.snapshot_count(doc), 1);
    }

    #[tokio::test]
    async fn test_flush_all_saves_only_dirty() {
        let (store, sessions, persistence) = setup();
        let dirty = Uuid::new_v4();
        let clean = Uuid::new_v4();
        sessions.acquire(dirty).await.unwrap();
        sessions.acquire(clean).await.unwrap();
        sessions
            .apply_remote_update(dirty, &text_update("x"), Uuid::new_v4())
            .await
            .unwrap();

        let report = persistence.flush_all(SaveCause::Shutdown).await;
        assert!(report.is_clean());
        assert_eq!(report.saved, vec![(dirty, 1)]);
        assert_eq!(store.snapshot_count(clean), 0);
    }

    #[tokio::test]
    async fn test_concurrent_saves_get_distinct_versions() {
        let (store, sessions, persistence) = setup();
        let persistence = Arc::new(persistence);
        let doc = Uuid::new_v4();
        sessions.acquire(doc).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let persistence = persistence.clone();
                tokio::spawn(async move { persistence.save_now(doc).await.unwrap() })
            })
            .collect();
        let mut versions = Vec::new();
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());
        assert_eq!(store.list_versions(doc).unwrap(), versions);
    }

    #[tokio::test]
    async fn test_eviction_save_does_not_reset_idle_clock() {
        let (_, sessions, persistence) = setup();
        let doc = Uuid::new_v4();
        let ticket = sessions.join(doc, PeerInfo::new("Alice")).await.unwrap();
        sessions
            .apply_remote_update(doc, &text_update("x"), ticket.member_id)
            .await
            .unwrap();
        sessions.release(doc, ticket.member_id).await.unwrap();
        let idle_since = sessions.get(doc).await.unwrap().last_activity().await;

        persistence.save(doc, SaveCause::Eviction).await.unwrap();
        assert_eq!(sessions.get(doc).await.unwrap().last_activity().await, idle_since);
        assert_eq!(sessions.phase(doc).await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_unloaded_history_marks_session_conflicting() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            skip_failed_hydration: true,
            ..SessionConfig::default()
        };
        let sessions = Arc::new(SessionManager::new(YrsEngine, store.clone(), config));
        let persistence = PersistenceCoordinator::new(sessions.clone());
        let doc = Uuid::new_v4();
        store.put_snapshot(doc, 1, &text_update("history")).unwrap();

        // Hydration falls back to an empty state that knows nothing of v1
        store.set_unavailable(true);
        let session = sessions.acquire(doc).await.unwrap();
        store.set_unavailable(false);
        assert_eq!(session.last_persisted_version().await, None);
        sessions
            .apply_remote_update(doc, &text_update("fresh"), Uuid::new_v4())
            .await
            .unwrap();
        assert!(!sessions.has_history_conflict(doc).await);

        for _ in 0..2 {
            let err = persistence.save_now(doc).await.unwrap_err();
            assert!(matches!(err, SyncError::Save { .. }));
            assert!(sessions.has_history_conflict(doc).await);
        }
        assert!(session.is_dirty().await);
        assert_eq!(persistence.stats().saves_failed, 2);
        let latest = store.latest_snapshot(doc).unwrap().unwrap();
        assert_eq!((latest.version, text_of(&latest.payload)), (1, "history".to_string()));
    }
}

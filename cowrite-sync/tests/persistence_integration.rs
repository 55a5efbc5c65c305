//! Persistence integration tests.
//!
//! Verifies, against a real RocksDB store:
//! - Save/hydrate roundtrip through the session stack
//! - Restart: snapshots and version numbering survive reopening the store
//! - Eviction saves and shutdown flushes land on disk
//! - Multi-document isolation and large document compression

use cowrite_sync::config::{PersistenceConfig, ServerConfig, SessionConfig};
use cowrite_sync::persistence::{PersistenceCoordinator, SaveCause};
use cowrite_sync::protocol::PeerInfo;
use cowrite_sync::server::SyncServer;
use cowrite_sync::session::{SessionManager, SessionPhase};
use cowrite_sync::lifecycle::Reaper;
use cowrite_sync::storage::{RocksStore, SnapshotStore, StoreConfig};
use cowrite_sync::{CrdtEngine, YrsEngine};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Stack {
    store: Arc<RocksStore>,
    sessions: Arc<SessionManager<YrsEngine>>,
    persistence: Arc<PersistenceCoordinator<YrsEngine>>,
}

fn open_stack(path: &Path) -> Stack {
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap());
    let sessions = Arc::new(SessionManager::new(
        YrsEngine,
        store.clone(),
        SessionConfig::default(),
    ));
    let persistence = Arc::new(PersistenceCoordinator::new(sessions.clone()));
    Stack {
        store,
        sessions,
        persistence,
    }
}

/// Append `content` to the shared text; returns the incremental update.
fn text_update(doc: &Doc, content: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, content);
    }
    doc.transact().encode_state_as_update_v1(&before)
}

fn text_of(state: &[u8]) -> String {
    let mut doc = YrsEngine.new_state();
    YrsEngine.merge(&mut doc, state).unwrap();
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

/// Generate repetitive text of given approximate byte count for compression testing.
fn repetitive_text(approx_bytes: usize) -> String {
    let pattern = "The quick brown fox jumps over the lazy dog. ";
    pattern.repeat(approx_bytes / pattern.len() + 1)
}

// ─── Save/Hydrate Roundtrip ──────────────────────────────────────────────────

#[tokio::test]
async fn test_save_then_rehydrate_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc_id = Uuid::new_v4();
    let author = Doc::new();

    {
        let stack = open_stack(&db_path);
        stack.sessions.acquire(doc_id).await.unwrap();
        stack
            .sessions
            .apply_remote_update(doc_id, &text_update(&author, "Survives restart"), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(stack.persistence.save_now(doc_id).await.unwrap(), 1);
    }

    let stack = open_stack(&db_path);
    let session = stack.sessions.acquire(doc_id).await.unwrap();
    assert_eq!(session.last_persisted_version().await, Some(1));
    assert_eq!(
        text_of(&stack.sessions.encode_full_state(doc_id).await.unwrap()),
        "Survives restart"
    );
}

#[tokio::test]
async fn test_versions_continue_across_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc_id = Uuid::new_v4();

    {
        let stack = open_stack(&db_path);
        stack.sessions.acquire(doc_id).await.unwrap();
        stack.persistence.save_now(doc_id).await.unwrap();
        stack.persistence.save_now(doc_id).await.unwrap();
    }

    let stack = open_stack(&db_path);
    stack.sessions.acquire(doc_id).await.unwrap();
    assert_eq!(stack.persistence.save_now(doc_id).await.unwrap(), 3);
    assert_eq!(stack.store.list_versions(doc_id).unwrap(), vec![1, 2, 3]);

    let meta = stack.store.load_metadata(doc_id).unwrap().unwrap();
    assert_eq!(meta.latest_version, 3);
    assert_eq!(meta.snapshot_count, 3);
}

#[tokio::test]
async fn test_hydration_uses_latest_of_many_versions() {
    let dir = tempdir().unwrap();
    let stack = open_stack(&dir.path().join("db"));
    let doc_id = Uuid::new_v4();
    let author = Doc::new();

    stack.sessions.acquire(doc_id).await.unwrap();
    for (i, word) in ["alpha ", "beta ", "gamma"].iter().enumerate() {
        stack
            .sessions
            .apply_remote_update(doc_id, &text_update(&author, word), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(stack.persistence.save_now(doc_id).await.unwrap(), i as u64 + 1);
    }

    let latest = stack.store.latest_snapshot(doc_id).unwrap().unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(text_of(&latest.payload), "alpha beta gamma");
}

// ─── Eviction and Shutdown ───────────────────────────────────────────────────

#[tokio::test]
async fn test_eviction_persists_unsaved_work() {
    let dir = tempdir().unwrap();
    let stack = open_stack(&dir.path().join("db"));
    let reaper = Reaper::new(
        stack.sessions.clone(),
        stack.persistence.clone(),
        &SessionConfig {
            idle_grace: Duration::ZERO,
            ..SessionConfig::default()
        },
        &PersistenceConfig::default(),
    );
    let doc_id = Uuid::new_v4();

    let ticket = stack.sessions.join(doc_id, PeerInfo::new("Alice")).await.unwrap();
    stack
        .sessions
        .apply_remote_update(doc_id, &text_update(&Doc::new(), "never saved"), ticket.member_id)
        .await
        .unwrap();
    stack.sessions.release(doc_id, ticket.member_id).await.unwrap();

    assert_eq!(reaper.sweep().await, vec![doc_id]);
    assert_eq!(stack.sessions.phase(doc_id).await, SessionPhase::Evicted);

    let snapshot = stack.store.latest_snapshot(doc_id).unwrap().unwrap();
    assert_eq!(text_of(&snapshot.payload), "never saved");
}

#[tokio::test]
async fn test_shutdown_flush_writes_dirty_documents() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let config = ServerConfig {
        persistence: PersistenceConfig {
            save_on_shutdown: true,
            ..PersistenceConfig::default()
        },
        ..ServerConfig::default()
    };
    let server = SyncServer::with_store(config, store.clone());
    let docs: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    for (i, doc_id) in docs.iter().enumerate() {
        server.sessions().acquire(*doc_id).await.unwrap();
        server
            .sessions()
            .apply_remote_update(*doc_id, &text_update(&Doc::new(), &format!("doc {i}")), Uuid::new_v4())
            .await
            .unwrap();
    }

    let report = server.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(report.saved.len(), 3);
    for (i, doc_id) in docs.iter().enumerate() {
        let snapshot = store.latest_snapshot(*doc_id).unwrap().unwrap();
        assert_eq!(text_of(&snapshot.payload), format!("doc {i}"));
    }
}

#[tokio::test]
async fn test_server_opens_rocks_store_from_config() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config).unwrap();
    let doc_id = Uuid::new_v4();

    server.sessions().acquire(doc_id).await.unwrap();
    let version = server
        .persistence()
        .save_if_dirty(doc_id, SaveCause::Request)
        .await
        .unwrap();
    assert_eq!(version, None);

    let stats = server.stats().await;
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.snapshots_saved, 0);
}

// ─── Isolation and Size ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let stack = open_stack(&dir.path().join("db"));
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    stack.sessions.acquire(doc_a).await.unwrap();
    stack.sessions.acquire(doc_b).await.unwrap();
    stack
        .sessions
        .apply_remote_update(doc_a, &text_update(&Doc::new(), "A"), Uuid::new_v4())
        .await
        .unwrap();

    for _ in 0..4 {
        stack.persistence.save_now(doc_a).await.unwrap();
    }
    stack.persistence.save_now(doc_b).await.unwrap();

    assert_eq!(stack.store.list_versions(doc_a).unwrap().len(), 4);
    assert_eq!(stack.store.list_versions(doc_b).unwrap(), vec![1]);
    assert_eq!(text_of(&stack.store.latest_snapshot(doc_b).unwrap().unwrap().payload), "");

    let mut documents = stack.store.list_documents().unwrap();
    documents.sort();
    let mut expected = vec![doc_a, doc_b];
    expected.sort();
    assert_eq!(documents, expected);
}

#[tokio::test]
async fn test_large_document_persistence() {
    let dir = tempdir().unwrap();
    let stack = open_stack(&dir.path().join("db"));
    let doc_id = Uuid::new_v4();

    // ~500KB of text
    let large_content = repetitive_text(500_000);
    stack.sessions.acquire(doc_id).await.unwrap();
    stack
        .sessions
        .apply_remote_update(doc_id, &text_update(&Doc::new(), &large_content), Uuid::new_v4())
        .await
        .unwrap();
    stack.persistence.save_now(doc_id).await.unwrap();

    let meta = stack.store.load_metadata(doc_id).unwrap().unwrap();
    assert!(meta.compressed_size < meta.payload_size);

    let snapshot = stack.store.latest_snapshot(doc_id).unwrap().unwrap();
    assert_eq!(text_of(&snapshot.payload).len(), large_content.len());
}

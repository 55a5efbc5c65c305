//! In-process snapshot store.
//!
//! Used when no storage path is configured, and by tests. Can be switched
//! into an unavailable state to exercise hydration and save failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use uuid::Uuid;

use super::{unix_now, Snapshot, SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, BTreeMap<u64, Snapshot>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of snapshots stored for `doc_id`.
    pub fn snapshot_count(&self, doc_id: Uuid) -> usize {
        self.documents
            .read()
            .map(|docs| docs.get(&doc_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Fetch a specific version.
    pub fn snapshot(&self, doc_id: Uuid, version: u64) -> Option<Snapshot> {
        let docs = self.documents.read().ok()?;
        docs.get(&doc_id)?.get(&version).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl SnapshotStore for MemoryStore {
    fn latest_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        self.check_available()?;
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&doc_id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    fn put_snapshot(
        &self,
        doc_id: Uuid,
        version: u64,
        payload: &[u8],
    ) -> Result<Snapshot, StoreError> {
        self.check_available()?;
        let mut docs = self.documents.write().map_err(poisoned)?;
        let versions = docs.entry(doc_id).or_default();

        if let Some((&latest, _)) = versions.iter().next_back() {
            if version <= latest {
                return Err(StoreError::VersionConflict {
                    doc_id,
                    attempted: version,
                    latest,
                });
            }
        }

        let snapshot = Snapshot {
            doc_id,
            version,
            payload: payload.to_vec(),
            created_at: unix_now(),
        };
        versions.insert(version, snapshot.clone());
        Ok(snapshot)
    }

    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<u64>, StoreError> {
        self.check_available()?;
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&doc_id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default())
    }
}

//! Idle eviction.
//!
//! The reaper periodically looks for sessions that have had no members for
//! the configured grace period and drops them from memory. With
//! `save_on_evict`, a dirty session is saved first and kept when that save
//! fails. The exception is a session whose store holds history it never
//! loaded: no save of it can succeed, so it is evicted unsaved.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::{PersistenceConfig, SessionConfig};
use crate::engine::CrdtEngine;
use crate::persistence::{PersistenceCoordinator, SaveCause};
use crate::session::SessionManager;

pub struct Reaper<E: CrdtEngine> {
    sessions: Arc<SessionManager<E>>,
    persistence: Arc<PersistenceCoordinator<E>>,
    idle_grace: Duration,
    save_on_evict: bool,
}

impl<E: CrdtEngine> Reaper<E> {
    pub fn new(
        sessions: Arc<SessionManager<E>>,
        persistence: Arc<PersistenceCoordinator<E>>,
        session_config: &SessionConfig,
        persistence_config: &PersistenceConfig,
    ) -> Self {
        Self {
            sessions,
            persistence,
            idle_grace: session_config.idle_grace,
            save_on_evict: persistence_config.save_on_evict,
        }
    }

    /// Evict every eligible session once. Returns the evicted documents.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let mut evicted = Vec::new();

        for (doc_id, dirty) in self.sessions.idle_candidates(self.idle_grace).await {
            if dirty && self.save_on_evict {
                match self.persistence.save(doc_id, SaveCause::Eviction).await {
                    Ok(_) => {}
                    Err(e) if self.sessions.has_history_conflict(doc_id).await => {
                        log::warn!("Evicting idle doc {doc_id} without a final save: {e}");
                    }
                    Err(e) => {
                        log::warn!("Keeping idle doc {doc_id} in memory: {e}");
                        continue;
                    }
                }
            }

            if self
                .sessions
                .try_evict(doc_id, self.idle_grace, self.save_on_evict)
                .await
            {
                evicted.push(doc_id);
            }
        }

        if !evicted.is_empty() {
            log::debug!("Reaper evicted {} idle sessions", evicted.len());
        }
        evicted
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        // tokio rejects a zero period
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            log::info!(
                "Reaper sweeping every {interval:?} (idle grace {:?})",
                self.idle_grace
            );

            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

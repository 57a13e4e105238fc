//! Session manager: in-memory handle map over the durable store, per-session
//! transition locks, and the background idle-expiry sweeper.

use crate::error::{PromptLoomError, Result};
use crate::sessions::{ChainSession, SessionState, SessionStore};
use crate::surface::{SurfaceEvent, SurfaceEvents};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Compact read-only view of one session for the resource surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub chain_id: String,
    pub prompt_id: String,
    pub current_step: u32,
    pub total_steps: u32,
    pub state: &'static str,
    pub last_activity: DateTime<Utc>,
}

/// Shared session manager. Each session is guarded by its own lock, held for
/// the duration of a single state transition; the outer map lock is never
/// held across a transition.
#[derive(Clone)]
pub struct SessionManager {
    store: SessionStore,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<ChainSession>>>>>,
    events: SurfaceEvents,
    idle_expiry: Duration,
}

impl SessionManager {
    pub fn new(store: SessionStore, events: SurfaceEvents, idle_expiry: Duration) -> Self {
        Self {
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
            idle_expiry,
        }
    }

    /// Register a freshly created session and persist it
    pub async fn create(&self, session: ChainSession) -> Result<Arc<Mutex<ChainSession>>> {
        let chain_id = session.chain_id.clone();
        self.store.save(&session)?;
        let handle = Arc::new(Mutex::new(session));
        self.sessions
            .lock()
            .await
            .insert(chain_id.clone(), Arc::clone(&handle));
        self.events
            .publish(SurfaceEvent::SessionUpdated { chain_id });
        Ok(handle)
    }

    /// Fetch a session handle, reloading from durable storage when the
    /// in-memory map lost it (process restart, expiry race).
    pub async fn get(&self, chain_id: &str) -> Result<Option<Arc<Mutex<ChainSession>>>> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(handle) = sessions.get(chain_id) {
                return Ok(Some(Arc::clone(handle)));
            }
        }
        match self.store.load(chain_id)? {
            Some(session) => {
                let handle = Arc::new(Mutex::new(session));
                let mut sessions = self.sessions.lock().await;
                // Another request may have loaded it concurrently; keep the winner
                let entry = sessions
                    .entry(chain_id.to_string())
                    .or_insert_with(|| Arc::clone(&handle));
                Ok(Some(Arc::clone(entry)))
            }
            None => Ok(None),
        }
    }

    /// Persist a session after a transition and announce the update
    pub fn persist(&self, session: &ChainSession) -> Result<()> {
        self.store.save(session)?;
        self.events.publish(SurfaceEvent::SessionUpdated {
            chain_id: session.chain_id.clone(),
        });
        Ok(())
    }

    /// Drop a session from memory and durable storage
    pub async fn remove(&self, chain_id: &str) -> Result<()> {
        self.sessions.lock().await.remove(chain_id);
        self.store.delete(chain_id)?;
        self.events.publish(SurfaceEvent::SessionUpdated {
            chain_id: chain_id.to_string(),
        });
        Ok(())
    }

    /// Summaries of all known sessions (memory plus store)
    pub async fn summaries(&self) -> Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        // Collect handles first; session locks are never taken while the
        // map lock is held
        let handles: Vec<(String, Arc<Mutex<ChainSession>>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                .collect()
        };
        for (id, handle) in handles {
            let session = handle.lock().await;
            seen.insert(id);
            out.push(summary_of(&session));
        }
        for id in self.store.list_ids()? {
            if !seen.contains(&id)
                && let Some(session) = self.store.load(&id)?
            {
                out.push(summary_of(&session));
            }
        }
        out.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        Ok(out)
    }

    /// Remove sessions idle beyond the expiry threshold. Returns expired ids.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        let candidates: Vec<(String, Arc<Mutex<ChainSession>>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                .collect()
        };
        for (id, handle) in candidates {
            let is_expired = {
                let mut session = handle.lock().await;
                if session.idle_longer_than(self.idle_expiry, now) {
                    session.terminate();
                    true
                } else {
                    false
                }
            };
            if is_expired {
                self.remove(&id).await?;
                expired.push(id);
            }
        }
        // Stored-but-unloaded sessions expire too
        for id in self.store.list_ids()? {
            if expired.contains(&id) {
                continue;
            }
            let in_memory = self.sessions.lock().await.contains_key(&id);
            if in_memory {
                continue;
            }
            if let Some(session) = self.store.load(&id)?
                && session.idle_longer_than(self.idle_expiry, now)
            {
                self.store.delete(&id)?;
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            tracing::info!("expired {} idle sessions", expired.len());
        }
        Ok(expired)
    }

    /// Background sweeper task; interval is bounded by the caller per config
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.sweep_expired(Utc::now()).await {
                            tracing::warn!("session sweep failed: {}", err);
                        }
                    }
                }
            }
        });
    }

    /// Guard against conflicting restart semantics
    pub fn check_restart_conflict(chain_id: Option<&str>, force_restart: bool) -> Result<()> {
        if force_restart && chain_id.is_some() {
            return Err(PromptLoomError::Session {
                message: "force_restart cannot be combined with chain_id".to_string(),
            });
        }
        Ok(())
    }
}

fn summary_of(session: &ChainSession) -> SessionSummary {
    SessionSummary {
        chain_id: session.chain_id.clone(),
        prompt_id: session.prompt_id.clone(),
        current_step: session.current_step,
        total_steps: session.total_steps,
        state: session.state.as_str(),
        last_activity: session.last_activity,
    }
}

/// True when the session can accept a verdict-bearing call
pub fn accepts_verdict(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::PendingReview | SessionState::AwaitingUserChoice
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, idle: Duration) -> SessionManager {
        SessionManager::new(
            SessionStore::new(dir.path()),
            SurfaceEvents::new(),
            idle,
        )
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(3600));
        let session = ChainSession::new(">>a", "a", 2, BTreeMap::new());
        let chain_id = session.chain_id.clone();
        manager.create(session).await.unwrap();

        let handle = manager.get(&chain_id).await.unwrap().unwrap();
        assert_eq!(handle.lock().await.total_steps, 2);
    }

    #[tokio::test]
    async fn get_reloads_from_disk_after_memory_loss() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir, Duration::from_secs(3600));
        let session = ChainSession::new(">>a", "a", 2, BTreeMap::new());
        let chain_id = session.chain_id.clone();
        first.create(session).await.unwrap();

        // A fresh manager over the same store simulates a restart
        let second = manager(&dir, Duration::from_secs(3600));
        let handle = second.get(&chain_id).await.unwrap().unwrap();
        assert_eq!(handle.lock().await.prompt_id, "a");
    }

    #[tokio::test]
    async fn sweep_removes_only_idle_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(60));
        let mut stale = ChainSession::new(">>a", "a", 1, BTreeMap::new());
        stale.last_activity = Utc::now() - chrono::Duration::seconds(600);
        let stale_id = stale.chain_id.clone();
        let fresh = ChainSession::new(">>b", "b", 1, BTreeMap::new());
        let fresh_id = fresh.chain_id.clone();
        // Write the stale timestamp straight to the store so create() does not
        // refresh it
        SessionStore::new(dir.path()).save(&stale).unwrap();
        manager.create(fresh).await.unwrap();

        let expired = manager.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(expired, vec![stale_id.clone()]);
        assert!(manager.get(&stale_id).await.unwrap().is_none());
        assert!(manager.get(&fresh_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restart_conflict_detected() {
        assert!(SessionManager::check_restart_conflict(Some("chain-x"), true).is_err());
        assert!(SessionManager::check_restart_conflict(None, true).is_ok());
        assert!(SessionManager::check_restart_conflict(Some("chain-x"), false).is_ok());
    }
}

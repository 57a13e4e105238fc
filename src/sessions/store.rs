//! Durable session storage: one JSON file per chain id, written on every
//! mutation and reloaded on demand after transport disconnection.

use crate::error::{PromptLoomError, Result};
use crate::sessions::{ChainSession, SESSION_FORMAT_VERSION};
use std::path::{Path, PathBuf};

/// File-backed session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, chain_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", chain_id))
    }

    /// Persist a session. Writes to a temp file then renames so a crash never
    /// leaves a torn file behind.
    pub fn save(&self, session: &ChainSession) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(session)?;
        let target = self.path_for(&session.chain_id);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Load a session by chain id; None when no file exists
    pub fn load(&self, chain_id: &str) -> Result<Option<ChainSession>> {
        let path = self.path_for(chain_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut session: ChainSession =
            serde_json::from_str(&content).map_err(|e| PromptLoomError::Session {
                message: format!("corrupt session file {}: {}", path.display(), e),
            })?;
        if session.format_version > SESSION_FORMAT_VERSION {
            return Err(PromptLoomError::Session {
                message: format!(
                    "session {} uses format v{} newer than supported v{}",
                    chain_id, session.format_version, SESSION_FORMAT_VERSION
                ),
            });
        }
        // Older envelopes are accepted read-only and upgraded on next write
        if session.format_version < SESSION_FORMAT_VERSION {
            tracing::info!(
                "upgrading session {} from format v{}",
                chain_id,
                session.format_version
            );
            session.format_version = SESSION_FORMAT_VERSION;
        }
        Ok(Some(session))
    }

    pub fn delete(&self, chain_id: &str) -> Result<()> {
        let path = self.path_for(chain_id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Chain ids of every stored session
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn save_load_round_trip_is_byte_stable() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let mut session = ChainSession::new(">>a", "a", 2, BTreeMap::new());
        session.record_rendered("step one".to_string());
        session.capture_output(1, "output one".to_string());
        store.save(&session).unwrap();

        let loaded = store.load(&session.chain_id).unwrap().unwrap();
        let first = serde_json::to_vec_pretty(&loaded).unwrap();
        let reloaded = store.load(&session.chain_id).unwrap().unwrap();
        let second = serde_json::to_vec_pretty(&reloaded).unwrap();
        assert_eq!(first, second);
        assert_eq!(loaded.chain_id, session.chain_id);
        assert_eq!(loaded.step_output(1), Some("output one"));
    }

    #[test]
    fn missing_session_is_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("chain-missing").unwrap().is_none());
    }

    #[test]
    fn newer_format_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let mut session = ChainSession::new(">>a", "a", 1, BTreeMap::new());
        session.format_version = SESSION_FORMAT_VERSION + 1;
        store.save(&session).unwrap();
        assert!(store.load(&session.chain_id).is_err());
    }

    #[test]
    fn older_format_upgrades_on_load() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let mut session = ChainSession::new(">>a", "a", 1, BTreeMap::new());
        session.format_version = 0;
        store.save(&session).unwrap();
        let loaded = store.load(&session.chain_id).unwrap().unwrap();
        assert_eq!(loaded.format_version, SESSION_FORMAT_VERSION);
    }

    #[test]
    fn list_ids_sees_saved_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let a = ChainSession::new(">>a", "a", 1, BTreeMap::new());
        let b = ChainSession::new(">>b", "b", 1, BTreeMap::new());
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        let ids = store.list_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.chain_id));
    }
}

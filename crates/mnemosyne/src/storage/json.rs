//! JSON file session storage — the document-per-session backend.
//!
//! One `{session_id}.json` file per session, holding the full serialized
//! record. Listing is a linear directory scan with in-memory filtering,
//! an accepted ceiling for this low-volume backend. Two writers to the
//! same session race, last write wins; no concurrency guarantee is made.

use crate::error::{Error, Result};
use crate::session::{Session, StorageMode};
use crate::storage::SessionStorage;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Default session directory under the user's home.
const DEFAULT_SESSIONS_DIR: &str = ".mnemosyne/sessions";

/// JSON-file-backed session store.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    dir_path: PathBuf,
    mode: StorageMode,
}

impl JsonStorage {
    /// Create a store with the default directory (`~/.mnemosyne/sessions`).
    #[must_use]
    pub fn new(mode: StorageMode) -> Self {
        let dir_path = dirs::home_dir()
            .map(|h| h.join(DEFAULT_SESSIONS_DIR))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSIONS_DIR));
        Self { dir_path, mode }
    }

    /// Create a store over a custom directory.
    #[must_use]
    pub fn with_path(path: impl AsRef<Path>, mode: StorageMode) -> Self {
        Self {
            dir_path: path.as_ref().to_path_buf(),
            mode,
        }
    }

    /// Directory the session documents live in.
    #[must_use]
    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir_path.join(format!("{session_id}.json"))
    }

    /// Shared fail-soft handler: lazily create a missing directory,
    /// otherwise log and move on.
    async fn absorb_failure(&self, op: &'static str, err: &Error) {
        if !self.dir_path.exists() {
            debug!(dir = ?self.dir_path, op, "session directory missing, creating for future operations");
            if let Err(e) = self.create().await {
                error!(dir = ?self.dir_path, error = %e, "failed to lazily create session directory");
            }
        } else {
            debug!(dir = ?self.dir_path, op, error = %err, "session storage operation failed");
        }
    }

    async fn load_file(&self, path: &Path) -> Result<Option<Session>> {
        let text = tokio::fs::read_to_string(path).await?;
        let value: Value = serde_json::from_str(&text)?;
        Ok(Session::from_value(self.mode, value))
    }

    async fn try_read(&self, session_id: &str, user_id: Option<&str>) -> Result<Option<Session>> {
        let path = self.session_path(session_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&text)?;
        if let Some(user_id) = user_id {
            if value.get("user_id").and_then(Value::as_str) != Some(user_id) {
                return Ok(None);
            }
        }
        Ok(Session::from_value(self.mode, value))
    }

    /// Full directory scan with in-memory filtering, newest-created first.
    async fn scan(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let session = match self.load_file(&path).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = ?path, error = %e, "skipping unreadable session file");
                    continue;
                }
            };
            if let Some(user_id) = user_id {
                if session.user_id() != Some(user_id) {
                    continue;
                }
            }
            if let Some(entity_id) = entity_id {
                if session.entity_id() != Some(entity_id) {
                    continue;
                }
            }
            sessions.push(session);
        }
        sessions.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.session_id().cmp(b.session_id()))
        });
        Ok(sessions)
    }

    async fn try_upsert(&self, session: &Session) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut stamped = session.clone();
        stamped.set_updated_at(now);
        if stamped.created_at().is_none() {
            // First write: created_at matches the stamp just taken.
            stamped.set_created_at(now);
        }
        let text = serde_json::to_string_pretty(&stamped)?;
        tokio::fs::write(self.session_path(session.session_id()), text).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for JsonStorage {
    fn name(&self) -> &'static str {
        "json"
    }

    fn mode(&self) -> StorageMode {
        self.mode
    }

    fn set_mode(&mut self, mode: StorageMode) {
        self.mode = mode;
    }

    async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir_path).await?;
        Ok(())
    }

    async fn read(&self, session_id: &str, user_id: Option<&str>) -> Option<Session> {
        match self.try_read(session_id, user_id).await {
            Ok(found) => found,
            Err(e) => {
                self.absorb_failure("read", &e).await;
                None
            }
        }
    }

    async fn get_all_session_ids(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Vec<String> {
        self.get_all_sessions(user_id, entity_id)
            .await
            .into_iter()
            .map(|s| s.session_id().to_string())
            .collect()
    }

    async fn get_all_sessions(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Vec<Session> {
        match self.scan(user_id, entity_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                self.absorb_failure("get_all_sessions", &e).await;
                Vec::new()
            }
        }
    }

    async fn upsert_with_retry(
        &self,
        session: &Session,
        create_and_retry: bool,
    ) -> Option<Session> {
        if session.mode() != self.mode {
            warn!(
                expected = %self.mode,
                got = %session.mode(),
                session_id = session.session_id(),
                "session mode does not match storage mode"
            );
            return None;
        }
        match self.try_upsert(session).await {
            Ok(()) => self.read(session.session_id(), None).await,
            Err(e) => {
                if create_and_retry && !self.dir_path.exists() {
                    debug!(dir = ?self.dir_path, "session directory missing, creating and retrying upsert");
                    if let Err(e) = self.create().await {
                        error!(dir = ?self.dir_path, error = %e, "failed to create session directory for upsert retry");
                        return None;
                    }
                    return self.upsert_with_retry(session, false).await;
                }
                debug!(
                    session_id = session.session_id(),
                    error = %e,
                    "failed to upsert session"
                );
                None
            }
        }
    }

    async fn delete_session(&self, session_id: &str) {
        let path = self.session_path(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(session_id, "session deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(session_id, "no session found to delete");
            }
            Err(e) => error!(session_id, error = %e, "failed to delete session"),
        }
    }

    async fn drop_storage(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
        }
        debug!(dir = ?self.dir_path, "dropped all session documents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AgentSession, WorkflowSession};
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> JsonStorage {
        JsonStorage::with_path(dir.path(), StorageMode::Agent)
    }

    fn agent_session(id: &str, user: &str) -> Session {
        Session::from(
            AgentSession::new(id)
                .with_agent_id("a1")
                .with_user_id(user)
                .with_memory(json!({"a": 1})),
        )
    }

    #[tokio::test]
    async fn test_upsert_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let persisted = store.upsert(&agent_session("s1", "u1")).await.unwrap();
        assert!(dir.path().join("s1.json").exists());

        let read = store.read("s1", None).await.unwrap();
        assert_eq!(read.memory(), Some(&json!({"a": 1})));
        assert_eq!(read, persisted);
    }

    #[tokio::test]
    async fn test_first_write_timestamps_match() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // No created_at supplied: it is set equal to the new updated_at.
        let persisted = store.upsert(&agent_session("s2", "u1")).await.unwrap();
        assert_eq!(persisted.created_at(), persisted.updated_at());
        assert!(persisted.created_at().is_some());
    }

    #[tokio::test]
    async fn test_reupsert_keeps_created_at() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = store.upsert(&agent_session("s1", "u1")).await.unwrap();
        let created = first.created_at().unwrap();

        let second = store.upsert(&first).await.unwrap();
        assert_eq!(second.created_at(), Some(created));
        assert!(second.updated_at().unwrap() >= first.updated_at().unwrap());
    }

    #[tokio::test]
    async fn test_user_filter_on_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert(&agent_session("s1", "u1")).await.unwrap();

        assert!(store.read("s1", None).await.is_some());
        assert!(store.read("s1", Some("u1")).await.is_some());
        assert!(store.read("s1", Some("u2")).await.is_none());
    }

    #[tokio::test]
    async fn test_listing_order_filters_and_tie_break() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for (id, user, created) in [("b", "u1", 100), ("c", "u2", 300), ("a", "u1", 100)] {
            let mut session = agent_session(id, user);
            session.set_created_at(created);
            store.upsert(&session).await.unwrap();
        }

        let ids = store.get_all_session_ids(None, None).await;
        assert_eq!(ids, vec!["c", "a", "b"]);

        let ids = store.get_all_session_ids(Some("u1"), None).await;
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get_all_sessions(None, Some("a1")).await.len(), 3);
        assert!(store.get_all_session_ids(None, Some("zz")).await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert(&agent_session("s1", "u1")).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();

        let ids = store.get_all_session_ids(None, None).await;
        assert_eq!(ids, vec!["s1"]);
        assert!(store.read("broken", None).await.is_none());
    }

    #[tokio::test]
    async fn test_lazy_creation_of_directory() {
        let dir = TempDir::new().unwrap();
        let store = JsonStorage::with_path(dir.path().join("nested/sessions"), StorageMode::Agent);

        // Never-initialized directory: read and list succeed, upsert creates it.
        assert!(store.read("s1", None).await.is_none());
        assert!(store.get_all_sessions(None, None).await.is_empty());
        assert!(store.upsert(&agent_session("s1", "u1")).await.is_some());
        assert!(store.dir_path().join("s1.json").exists());
    }

    #[tokio::test]
    async fn test_delete_session() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert(&agent_session("s1", "u1")).await.unwrap();

        store.delete_session("s1").await;
        assert!(store.read("s1", None).await.is_none());

        // Deleting an absent session is a quiet no-op.
        store.delete_session("s1").await;
    }

    #[tokio::test]
    async fn test_drop_storage_removes_only_documents() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert(&agent_session("s1", "u1")).await.unwrap();
        store.upsert(&agent_session("s2", "u1")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        store.drop_storage().await.unwrap();
        assert!(store.get_all_session_ids(None, None).await.is_empty());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_workflow_mode() {
        let dir = TempDir::new().unwrap();
        let store = JsonStorage::with_path(dir.path(), StorageMode::Workflow);
        let session = Session::from(
            WorkflowSession::new("w1")
                .with_workflow_id("wf-1")
                .with_workflow_data(json!({"step": 1})),
        );
        let persisted = store.upsert(&session).await.unwrap();
        assert_eq!(persisted.mode(), StorageMode::Workflow);
        assert_eq!(persisted.entity_id(), Some("wf-1"));

        // An agent-mode session is rejected by a workflow store.
        assert!(store.upsert(&agent_session("s1", "u1")).await.is_none());
    }
}

//! Storage backends for sessions.
//!
//! [`SessionStorage`] is the single contract every backend implements. The
//! transactional backends ([`SqliteStorage`], [`PostgresStorage`]) share
//! their table-definition logic through [`table::TableDef`]; the document
//! backend ([`JsonStorage`]) keeps one file per session.
//!
//! The contract is fail-soft: no error escapes `read`, the listing
//! operations, `upsert` or `delete_session`. Runtime failures are logged
//! and converted to `None` / an empty `Vec`, so a storage hiccup degrades a
//! caller's memory instead of crashing its run loop.

pub mod json;
pub mod postgres;
pub mod sqlite;
pub mod table;

pub use json::JsonStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::session::{Session, StorageMode};
use async_trait::async_trait;
use tracing::debug;

/// Contract implemented by every session storage backend.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Backend label for logging.
    fn name(&self) -> &'static str;

    /// The mode this store was configured for.
    fn mode(&self) -> StorageMode;

    /// Change the mode. The backend rebuilds its internal table definition
    /// (or equivalent) before the next operation.
    fn set_mode(&mut self, mode: StorageMode);

    /// Ensure the backing container (table/schema or directory) exists.
    /// Idempotent: a no-op when already present.
    async fn create(&self) -> Result<()>;

    /// Read a session by id.
    ///
    /// Returns `None` when no record matches, or when `user_id` is given
    /// and does not match the stored value.
    async fn read(&self, session_id: &str, user_id: Option<&str>) -> Option<Session>;

    /// All session ids, newest-created first, optionally filtered by
    /// `user_id` and/or the mode's entity id.
    async fn get_all_session_ids(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Vec<String>;

    /// All sessions, newest-created first, same filter rules as
    /// [`SessionStorage::get_all_session_ids`].
    async fn get_all_sessions(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Vec<Session>;

    /// Insert or update a session keyed by `session_id`.
    ///
    /// On success returns the freshly-read persisted record. On failure due
    /// to a missing container, creates the container and retries exactly
    /// once (`create_and_retry` guards the recursion); any other failure
    /// returns `None`.
    async fn upsert_with_retry(
        &self,
        session: &Session,
        create_and_retry: bool,
    ) -> Option<Session>;

    /// Insert or update a session, creating the container and retrying once
    /// if it is missing.
    async fn upsert(&self, session: &Session) -> Option<Session> {
        self.upsert_with_retry(session, true).await
    }

    /// Delete a session if present. Absence is a debug-logged no-op.
    async fn delete_session(&self, session_id: &str);

    /// Remove the entire backing container.
    async fn drop_storage(&self) -> Result<()>;

    /// Schema migration hook. Currently a no-op.
    async fn upgrade_schema(&self) {
        debug!(backend = self.name(), "upgrade_schema: nothing to do");
    }
}

//! SQLite session storage — the embedded/local transactional backend.

use crate::error::{Error, Result};
use crate::session::{AgentSession, Session, StorageMode, WorkflowSession};
use crate::storage::table::{SqlDialect, TableDef};
use crate::storage::SessionStorage;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// SQLite-backed session store.
///
/// One table per store, shaped by the configured [`StorageMode`]; no schema
/// namespace. Upserts are a single `INSERT .. ON CONFLICT DO UPDATE`
/// statement, so concurrent writers converge on the database's native
/// conflict resolution.
pub struct SqliteStorage {
    pool: SqlitePool,
    table: TableDef,
    auto_upgrade_schema: bool,
}

impl SqliteStorage {
    /// Create a store over an existing connection pool.
    pub fn new(pool: SqlitePool, table_name: &str, mode: StorageMode) -> Result<Self> {
        let table = TableDef::for_version(table_name, None, mode, 1, SqlDialect::Sqlite)?;
        Ok(Self {
            pool,
            table,
            auto_upgrade_schema: false,
        })
    }

    /// Open (or create) a store at the given database file path.
    pub async fn from_path(
        db_path: &Path,
        table_name: &str,
        mode: StorageMode,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        // Enable WAL for read/write concurrency
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        let store = Self::new(pool, table_name, mode)?;
        info!(table = table_name, "SQLite session store initialized at {}", db_path.display());
        Ok(store)
    }

    /// Create a store from a database URL.
    pub async fn from_url(url: &str, table_name: &str, mode: StorageMode) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Self::new(pool, table_name, mode)
    }

    /// In-memory store (for tests).
    pub async fn in_memory(table_name: &str, mode: StorageMode) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool, table_name, mode)?;
        debug!(table = table_name, "in-memory SQLite session store initialized");
        Ok(store)
    }

    /// Select a table schema version. Only version 1 is defined; any other
    /// version is a fatal configuration error.
    pub fn with_schema_version(mut self, version: i32) -> Result<Self> {
        self.table = TableDef::for_version(
            self.table.name(),
            None,
            self.table.mode(),
            version,
            SqlDialect::Sqlite,
        )?;
        Ok(self)
    }

    /// Reserved: opt in to automatic schema upgrades once migrations exist.
    #[must_use]
    pub fn with_auto_upgrade_schema(mut self, auto_upgrade_schema: bool) -> Self {
        self.auto_upgrade_schema = auto_upgrade_schema;
        self
    }

    async fn table_exists(&self) -> Result<bool> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(self.table.name())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Shared fail-soft handler: lazily create a missing table, otherwise
    /// log and move on.
    async fn absorb_failure(&self, op: &'static str, err: &Error) {
        if let Ok(false) = self.table_exists().await {
            debug!(table = %self.table.qualified_name(), op, "table missing, creating for future operations");
            if let Err(e) = self.create().await {
                error!(table = %self.table.qualified_name(), error = %e, "failed to lazily create table");
            }
        } else {
            debug!(table = %self.table.qualified_name(), op, error = %err, "session storage operation failed");
        }
    }

    fn row_to_session(&self, row: &SqliteRow) -> Result<Session> {
        let mode = self.table.mode();
        let session_id: String = row.try_get("session_id")?;
        let entity_id: Option<String> = row.try_get(mode.entity_id_column())?;
        let user_id: Option<String> = row.try_get("user_id")?;
        let memory = decode_json(row.try_get("memory")?)?;
        let entity_data = decode_json(row.try_get(mode.entity_data_column())?)?;
        let session_data = decode_json(row.try_get("session_data")?)?;
        let extra_data = decode_json(row.try_get("extra_data")?)?;
        let created_at: Option<i64> = row.try_get("created_at")?;
        let updated_at: Option<i64> = row.try_get("updated_at")?;

        Ok(match mode {
            StorageMode::Agent => Session::Agent(AgentSession {
                session_id,
                agent_id: entity_id,
                user_id,
                memory,
                agent_data: entity_data,
                session_data,
                extra_data,
                created_at,
                updated_at,
            }),
            StorageMode::Workflow => Session::Workflow(WorkflowSession {
                session_id,
                workflow_id: entity_id,
                user_id,
                memory,
                workflow_data: entity_data,
                session_data,
                extra_data,
                created_at,
                updated_at,
            }),
        })
    }

    async fn try_read(&self, session_id: &str, user_id: Option<&str>) -> Result<Option<Session>> {
        let sql = self.table.read_sql(user_id.is_some());
        let mut query = sqlx::query(&sql).bind(session_id);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(|r| self.row_to_session(r)).transpose()
    }

    async fn try_get_all_session_ids(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let sql = self.table.list_sql(true, user_id.is_some(), entity_id.is_some());
        let mut query = sqlx::query(&sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        if let Some(entity_id) = entity_id {
            query = query.bind(entity_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("session_id").map_err(Error::from))
            .collect()
    }

    async fn try_get_all_sessions(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<Vec<Session>> {
        let sql = self.table.list_sql(false, user_id.is_some(), entity_id.is_some());
        let mut query = sqlx::query(&sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        if let Some(entity_id) = entity_id {
            query = query.bind(entity_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.row_to_session(row) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(table = %self.table.qualified_name(), error = %e, "skipping undecodable session row"),
            }
        }
        Ok(sessions)
    }

    async fn try_upsert(&self, session: &Session) -> Result<()> {
        let cols = session.columns();
        let now = Utc::now().timestamp();
        let sql = self.table.upsert_sql();
        sqlx::query(&sql)
            .bind(cols.session_id)
            .bind(cols.entity_id)
            .bind(cols.user_id)
            .bind(encode_json(cols.memory)?)
            .bind(encode_json(cols.entity_data)?)
            .bind(encode_json(cols.session_data)?)
            .bind(encode_json(cols.extra_data)?)
            .bind(cols.created_at.unwrap_or(now))
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_delete(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query(&self.table.delete_sql())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// JSON blobs are stored as serialized TEXT in SQLite.
fn encode_json(value: Option<&Value>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

fn decode_json(text: Option<String>) -> Result<Option<Value>> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(Error::from)
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn mode(&self) -> StorageMode {
        self.table.mode()
    }

    fn set_mode(&mut self, mode: StorageMode) {
        if mode != self.table.mode() {
            self.table = self.table.with_mode(mode);
        }
    }

    async fn create(&self) -> Result<()> {
        if self.table_exists().await? {
            return Ok(());
        }
        debug!(table = %self.table.qualified_name(), "creating session table");
        sqlx::query(&self.table.create_table_sql())
            .execute(&self.pool)
            .await?;
        for index_sql in self.table.create_index_sql() {
            sqlx::query(&index_sql).execute(&self.pool).await?;
        }
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
        match self.try_get_all_session_ids(user_id, entity_id).await {
            Ok(ids) => ids,
            Err(e) => {
                self.absorb_failure("get_all_session_ids", &e).await;
                Vec::new()
            }
        }
    }

    async fn get_all_sessions(
        &self,
        user_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Vec<Session> {
        match self.try_get_all_sessions(user_id, entity_id).await {
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
        if session.mode() != self.mode() {
            warn!(
                expected = %self.mode(),
                got = %session.mode(),
                session_id = session.session_id(),
                "session mode does not match storage mode"
            );
            return None;
        }
        match self.try_upsert(session).await {
            Ok(()) => self.read(session.session_id(), None).await,
            Err(e) => {
                if create_and_retry && !self.table_exists().await.unwrap_or(true) {
                    debug!(table = %self.table.qualified_name(), "table missing, creating and retrying upsert");
                    if let Err(e) = self.create().await {
                        error!(table = %self.table.qualified_name(), error = %e, "failed to create table for upsert retry");
                        return None;
                    }
                    return self.upsert_with_retry(session, false).await;
                }
                debug!(
                    table = %self.table.qualified_name(),
                    session_id = session.session_id(),
                    error = %e,
                    "failed to upsert session"
                );
                None
            }
        }
    }

    async fn delete_session(&self, session_id: &str) {
        match self.try_delete(session_id).await {
            Ok(0) => debug!(session_id, "no session found to delete"),
            Ok(_) => debug!(session_id, "session deleted"),
            Err(e) => error!(session_id, error = %e, "failed to delete session"),
        }
    }

    async fn drop_storage(&self) -> Result<()> {
        if self.table_exists().await? {
            debug!(table = %self.table.qualified_name(), "dropping session table");
            sqlx::query(&self.table.drop_sql())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn upgrade_schema(&self) {
        debug!(
            table = %self.table.qualified_name(),
            auto_upgrade_schema = self.auto_upgrade_schema,
            "upgrade_schema: no migrations defined for schema version {}",
            self.table.version()
        );
    }
}

impl Clone for SqliteStorage {
    // The pool is a shared handle: cloning never opens a second connection.
    // The table definition is derived state and is rebuilt, not copied.
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            table: self.table.rebuild(),
            auto_upgrade_schema: self.auto_upgrade_schema,
        }
    }
}

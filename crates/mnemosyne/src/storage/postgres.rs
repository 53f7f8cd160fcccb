//! PostgreSQL session storage — the server-oriented transactional backend.
//!
//! Same contract and table layout as the SQLite flavor, plus a schema
//! namespace (default `ai`) created idempotently before the table. Blobs
//! are stored as JSONB and timestamps as BIGINT.

use crate::error::{Error, Result};
use crate::session::{AgentSession, Session, StorageMode, WorkflowSession};
use crate::storage::table::{SqlDialect, TableDef};
use crate::storage::SessionStorage;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, error, info, warn};

/// Default schema namespace for session tables.
const DEFAULT_SCHEMA: &str = "ai";

/// PostgreSQL-backed session store.
pub struct PostgresStorage {
    pool: PgPool,
    table: TableDef,
    auto_upgrade_schema: bool,
}

impl PostgresStorage {
    /// Create a store over an existing connection pool, in the default
    /// `ai` schema.
    pub fn new(pool: PgPool, table_name: &str, mode: StorageMode) -> Result<Self> {
        let table = TableDef::for_version(
            table_name,
            Some(DEFAULT_SCHEMA),
            mode,
            1,
            SqlDialect::Postgres,
        )?;
        Ok(Self {
            pool,
            table,
            auto_upgrade_schema: false,
        })
    }

    /// Create a store from a database URL.
    pub async fn from_url(url: &str, table_name: &str, mode: StorageMode) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self::new(pool, table_name, mode)?;
        info!(table = %store.table.qualified_name(), "Postgres session store initialized");
        Ok(store)
    }

    /// Override the schema namespace, or opt out of namespacing entirely.
    pub fn with_schema(mut self, schema: Option<&str>) -> Result<Self> {
        self.table = TableDef::for_version(
            self.table.name(),
            schema,
            self.table.mode(),
            self.table.version(),
            SqlDialect::Postgres,
        )?;
        Ok(self)
    }

    /// Select a table schema version. Only version 1 is defined; any other
    /// version is a fatal configuration error.
    pub fn with_schema_version(mut self, version: i32) -> Result<Self> {
        self.table = TableDef::for_version(
            self.table.name(),
            self.table.schema(),
            self.table.mode(),
            version,
            SqlDialect::Postgres,
        )?;
        Ok(self)
    }

    /// Reserved: opt in to automatic schema upgrades once migrations exist.
    #[must_use]
    pub fn with_auto_upgrade_schema(mut self, auto_upgrade_schema: bool) -> Self {
        self.auto_upgrade_schema = auto_upgrade_schema;
        self
    }

    /// Schema namespace this store writes into, if any.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.table.schema()
    }

    async fn table_exists(&self) -> Result<bool> {
        if let Some(schema) = self.table.schema() {
            let row = sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
            )
            .bind(schema)
            .fetch_one(&self.pool)
            .await?;
            if !row.try_get::<bool, _>(0)? {
                debug!(schema, "schema does not exist");
                return Ok(false);
            }
        }
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(self.table.schema().unwrap_or("public"))
        .bind(self.table.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
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

    fn row_to_session(&self, row: &PgRow) -> Result<Session> {
        let mode = self.table.mode();
        let session_id: String = row.try_get("session_id")?;
        let entity_id: Option<String> = row.try_get(mode.entity_id_column())?;
        let user_id: Option<String> = row.try_get("user_id")?;
        let memory: Option<Value> = row.try_get("memory")?;
        let entity_data: Option<Value> = row.try_get(mode.entity_data_column())?;
        let session_data: Option<Value> = row.try_get("session_data")?;
        let extra_data: Option<Value> = row.try_get("extra_data")?;
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
            .bind(cols.memory.cloned())
            .bind(cols.entity_data.cloned())
            .bind(cols.session_data.cloned())
            .bind(cols.extra_data.cloned())
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

#[async_trait]
impl SessionStorage for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
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
        if let Some(schema) = self.table.schema() {
            debug!(schema, "creating schema");
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                .execute(&self.pool)
                .await?;
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

impl Clone for PostgresStorage {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_pool() -> PgPool {
        // Connects lazily: nothing is dialed until the first query, which
        // these tests never issue.
        PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/mnemosyne_test")
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_schema() {
        let store = PostgresStorage::new(lazy_pool(), "sessions", StorageMode::Agent).unwrap();
        assert_eq!(store.schema(), Some("ai"));
        assert_eq!(store.name(), "postgres");
        assert_eq!(store.mode(), StorageMode::Agent);
    }

    #[tokio::test]
    async fn test_schema_override_and_opt_out() {
        let store = PostgresStorage::new(lazy_pool(), "sessions", StorageMode::Agent)
            .unwrap()
            .with_schema(Some("myschema"))
            .unwrap();
        assert_eq!(store.schema(), Some("myschema"));

        let store = store.with_schema(None).unwrap();
        assert_eq!(store.schema(), None);
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        assert!(PostgresStorage::new(lazy_pool(), "bad table", StorageMode::Agent).is_err());
        assert!(PostgresStorage::new(lazy_pool(), "sessions", StorageMode::Agent)
            .unwrap()
            .with_schema(Some("bad schema"))
            .is_err());
    }

    #[tokio::test]
    async fn test_unsupported_schema_version_is_fatal() {
        let result = PostgresStorage::new(lazy_pool(), "sessions", StorageMode::Agent)
            .unwrap()
            .with_schema_version(3);
        assert!(matches!(result, Err(Error::UnsupportedSchemaVersion(3))));
    }

    #[tokio::test]
    async fn test_set_mode_rebuilds_table() {
        let mut store =
            PostgresStorage::new(lazy_pool(), "sessions", StorageMode::Agent).unwrap();
        store.set_mode(StorageMode::Workflow);
        assert_eq!(store.mode(), StorageMode::Workflow);
    }
}

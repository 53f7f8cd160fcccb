//! Shared table-definition logic for the transactional backends.
//!
//! A [`TableDef`] is built once at construction from `(table name, schema,
//! mode, schema version)` and generates all SQL for its dialect. Version 1
//! is the only defined layout; requesting any other version fails at
//! construction. Table identifiers are validated before they are
//! interpolated into SQL, since bind parameters cannot carry identifiers.

use crate::error::{Error, Result};
use crate::session::StorageMode;

/// SQL dialect of a transactional backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Embedded / local storage
    Sqlite,
    /// Server storage with schema namespacing
    Postgres,
}

impl SqlDialect {
    fn json_type(self) -> &'static str {
        match self {
            Self::Sqlite => "TEXT",
            Self::Postgres => "JSONB",
        }
    }

    fn timestamp_type(self) -> &'static str {
        match self {
            Self::Sqlite => "INTEGER",
            Self::Postgres => "BIGINT",
        }
    }

    /// Placeholder for the `n`-th bind parameter (1-based).
    fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${n}"),
        }
    }
}

/// One column of the session table.
#[derive(Debug, Clone)]
struct ColumnDef {
    name: &'static str,
    sql_type: &'static str,
    primary_key: bool,
    indexed: bool,
}

/// Session table layout for one `(name, schema, mode, version, dialect)`
/// configuration.
#[derive(Debug)]
pub struct TableDef {
    name: String,
    schema: Option<String>,
    mode: StorageMode,
    version: i32,
    dialect: SqlDialect,
    columns: Vec<ColumnDef>,
}

impl TableDef {
    /// Build the table definition for a schema version.
    ///
    /// Fails with [`Error::UnsupportedSchemaVersion`] for any version this
    /// build does not define, and with [`Error::Config`] for identifiers
    /// that are not safe to interpolate.
    pub fn for_version(
        name: &str,
        schema: Option<&str>,
        mode: StorageMode,
        version: i32,
        dialect: SqlDialect,
    ) -> Result<Self> {
        validate_identifier(name)?;
        if let Some(schema) = schema {
            validate_identifier(schema)?;
        }
        let columns = Self::columns_for(version, mode, dialect)?;
        Ok(Self {
            name: name.to_string(),
            schema: schema.map(str::to_string),
            mode,
            version,
            dialect,
            columns,
        })
    }

    fn columns_for(
        version: i32,
        mode: StorageMode,
        dialect: SqlDialect,
    ) -> Result<Vec<ColumnDef>> {
        match version {
            1 => Ok(Self::columns_v1(mode, dialect)),
            other => Err(Error::UnsupportedSchemaVersion(other)),
        }
    }

    /// Version 1 layout: common columns plus the mode-specific id/data
    /// pair, with `user_id` and the mode id column indexed.
    fn columns_v1(mode: StorageMode, dialect: SqlDialect) -> Vec<ColumnDef> {
        vec![
            ColumnDef {
                name: "session_id",
                sql_type: "TEXT",
                primary_key: true,
                indexed: false,
            },
            ColumnDef {
                name: mode.entity_id_column(),
                sql_type: "TEXT",
                primary_key: false,
                indexed: true,
            },
            ColumnDef {
                name: "user_id",
                sql_type: "TEXT",
                primary_key: false,
                indexed: true,
            },
            ColumnDef {
                name: "memory",
                sql_type: dialect.json_type(),
                primary_key: false,
                indexed: false,
            },
            ColumnDef {
                name: mode.entity_data_column(),
                sql_type: dialect.json_type(),
                primary_key: false,
                indexed: false,
            },
            ColumnDef {
                name: "session_data",
                sql_type: dialect.json_type(),
                primary_key: false,
                indexed: false,
            },
            ColumnDef {
                name: "extra_data",
                sql_type: dialect.json_type(),
                primary_key: false,
                indexed: false,
            },
            ColumnDef {
                name: "created_at",
                sql_type: dialect.timestamp_type(),
                primary_key: false,
                indexed: false,
            },
            ColumnDef {
                name: "updated_at",
                sql_type: dialect.timestamp_type(),
                primary_key: false,
                indexed: false,
            },
        ]
    }

    /// Rebuild the definition from its configuration.
    ///
    /// Used by the clone path: the column layout is derived state and is
    /// reconstructed rather than copied.
    #[must_use]
    pub fn rebuild(&self) -> Self {
        // The version was validated at construction.
        let columns = Self::columns_for(self.version, self.mode, self.dialect)
            .unwrap_or_else(|_| self.columns.clone());
        Self {
            name: self.name.clone(),
            schema: self.schema.clone(),
            mode: self.mode,
            version: self.version,
            dialect: self.dialect,
            columns,
        }
    }

    /// Rebuild the definition for a different mode.
    #[must_use]
    pub fn with_mode(&self, mode: StorageMode) -> Self {
        let columns = Self::columns_for(self.version, mode, self.dialect)
            .unwrap_or_else(|_| self.columns.clone());
        Self {
            name: self.name.clone(),
            schema: self.schema.clone(),
            mode,
            version: self.version,
            dialect: self.dialect,
            columns,
        }
    }

    /// Table name without namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema namespace, if the dialect carries one.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Mode this layout was generated for.
    #[must_use]
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Schema version this layout was generated for.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    /// `schema.table`, or just `table` without a namespace.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }

    fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    fn select_list(&self) -> String {
        self.column_names().join(", ")
    }

    /// `CREATE TABLE IF NOT EXISTS` for this layout.
    #[must_use]
    pub fn create_table_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                if c.primary_key {
                    format!("{} {} PRIMARY KEY", c.name, c.sql_type)
                } else {
                    format!("{} {}", c.name, c.sql_type)
                }
            })
            .collect::<Vec<_>>()
            .join(",\n    ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.qualified_name(),
            columns
        )
    }

    /// `CREATE INDEX IF NOT EXISTS` statements for the indexed columns.
    #[must_use]
    pub fn create_index_sql(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.indexed)
            .map(|c| {
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {}({})",
                    self.name,
                    c.name,
                    self.qualified_name(),
                    c.name
                )
            })
            .collect()
    }

    /// Atomic insert-or-update keyed by `session_id`.
    ///
    /// Bind order matches the column order of this layout. The conflict
    /// branch updates every non-key column except `created_at`, which is
    /// write-once.
    #[must_use]
    pub fn upsert_sql(&self) -> String {
        let names = self.column_names();
        let placeholders = (1..=names.len())
            .map(|n| self.dialect.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = names
            .iter()
            .filter(|name| **name != "session_id" && **name != "created_at")
            .map(|name| format!("{name} = excluded.{name}"))
            .collect::<Vec<_>>()
            .join(",\n    ");
        format!(
            "INSERT INTO {} ({})\nVALUES ({})\nON CONFLICT(session_id) DO UPDATE SET\n    {}",
            self.qualified_name(),
            names.join(", "),
            placeholders,
            updates
        )
    }

    /// Primary-key lookup, optionally also matching `user_id`.
    #[must_use]
    pub fn read_sql(&self, with_user: bool) -> String {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE session_id = {}",
            self.select_list(),
            self.qualified_name(),
            self.dialect.placeholder(1)
        );
        if with_user {
            sql.push_str(&format!(" AND user_id = {}", self.dialect.placeholder(2)));
        }
        sql
    }

    /// Filtered listing, newest-created first with `session_id` breaking
    /// timestamp ties. Bind order: `user_id` first, then the entity id.
    #[must_use]
    pub fn list_sql(&self, ids_only: bool, with_user: bool, with_entity: bool) -> String {
        let select = if ids_only {
            "session_id".to_string()
        } else {
            self.select_list()
        };
        let mut sql = format!("SELECT {} FROM {}", select, self.qualified_name());
        let mut n = 0;
        if with_user {
            n += 1;
            sql.push_str(&format!(" WHERE user_id = {}", self.dialect.placeholder(n)));
        }
        if with_entity {
            n += 1;
            let keyword = if n == 1 { " WHERE" } else { " AND" };
            sql.push_str(&format!(
                "{keyword} {} = {}",
                self.mode.entity_id_column(),
                self.dialect.placeholder(n)
            ));
        }
        sql.push_str(" ORDER BY created_at DESC, session_id ASC");
        sql
    }

    /// Primary-key delete.
    #[must_use]
    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE session_id = {}",
            self.qualified_name(),
            self.dialect.placeholder(1)
        )
    }

    /// `DROP TABLE IF EXISTS`.
    #[must_use]
    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualified_name())
    }
}

/// Reject identifiers that are not safe to interpolate into SQL.
fn validate_identifier(ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid SQL identifier: {ident:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_agent() -> TableDef {
        TableDef::for_version("sessions", None, StorageMode::Agent, 1, SqlDialect::Sqlite)
            .unwrap()
    }

    fn pg_workflow() -> TableDef {
        TableDef::for_version(
            "sessions",
            Some("ai"),
            StorageMode::Workflow,
            1,
            SqlDialect::Postgres,
        )
        .unwrap()
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let err = TableDef::for_version("t", None, StorageMode::Agent, 2, SqlDialect::Sqlite)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchemaVersion(2)));
    }

    #[test]
    fn test_identifier_validation() {
        for bad in ["", "1abc", "se ssions", "t;drop", "a-b"] {
            assert!(
                TableDef::for_version(bad, None, StorageMode::Agent, 1, SqlDialect::Sqlite)
                    .is_err(),
                "accepted {bad:?}"
            );
        }
        assert!(
            TableDef::for_version("t", Some("bad schema"), StorageMode::Agent, 1, SqlDialect::Postgres)
                .is_err()
        );
        assert!(sqlite_agent().create_table_sql().contains("sessions"));
    }

    #[test]
    fn test_mode_selects_columns() {
        let agent = sqlite_agent();
        let sql = agent.create_table_sql();
        assert!(sql.contains("agent_id TEXT"));
        assert!(sql.contains("agent_data TEXT"));
        assert!(!sql.contains("workflow_id"));

        let workflow = pg_workflow();
        let sql = workflow.create_table_sql();
        assert!(sql.contains("workflow_id TEXT"));
        assert!(sql.contains("workflow_data JSONB"));
        assert!(!sql.contains("agent_id"));
    }

    #[test]
    fn test_dialect_types_and_namespace() {
        let sql = pg_workflow().create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS ai.sessions"));
        assert!(sql.contains("created_at BIGINT"));
        assert!(sql.contains("memory JSONB"));

        let sql = sqlite_agent().create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS sessions"));
        assert!(sql.contains("created_at INTEGER"));
        assert!(sql.contains("memory TEXT"));
    }

    #[test]
    fn test_indexes_cover_filter_columns() {
        let indexes = sqlite_agent().create_index_sql();
        assert_eq!(indexes.len(), 2);
        assert!(indexes[0].contains("idx_sessions_agent_id"));
        assert!(indexes[1].contains("idx_sessions_user_id"));

        let indexes = pg_workflow().create_index_sql();
        assert!(indexes[0].contains("ON ai.sessions(workflow_id)"));
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let sql = sqlite_agent().upsert_sql();
        assert!(sql.contains("ON CONFLICT(session_id) DO UPDATE SET"));
        assert!(sql.contains("updated_at = excluded.updated_at"));
        assert!(!sql.contains("created_at = excluded.created_at"));
        assert!(!sql.contains("session_id = excluded.session_id"));
    }

    #[test]
    fn test_postgres_placeholders_are_numbered() {
        let sql = pg_workflow().upsert_sql();
        assert!(sql.contains("$1"));
        assert!(sql.contains("$9"));
        assert!(!sql.contains('?'));

        let sql = pg_workflow().list_sql(true, true, true);
        assert!(sql.contains("WHERE user_id = $1"));
        assert!(sql.contains("AND workflow_id = $2"));
    }

    #[test]
    fn test_list_sql_ordering_and_filters() {
        let def = sqlite_agent();
        let sql = def.list_sql(false, false, false);
        assert!(sql.ends_with("ORDER BY created_at DESC, session_id ASC"));
        assert!(!sql.contains("WHERE"));

        let sql = def.list_sql(true, false, true);
        assert!(sql.starts_with("SELECT session_id FROM sessions"));
        assert!(sql.contains("WHERE agent_id = ?"));
    }

    #[test]
    fn test_rebuild_and_with_mode() {
        let def = sqlite_agent();
        let rebuilt = def.rebuild();
        assert_eq!(rebuilt.create_table_sql(), def.create_table_sql());

        let switched = def.with_mode(StorageMode::Workflow);
        assert_eq!(switched.mode(), StorageMode::Workflow);
        assert!(switched.create_table_sql().contains("workflow_id"));
        assert!(!switched.create_table_sql().contains("agent_id"));
    }
}

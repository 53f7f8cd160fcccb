//! Session data model.
//!
//! A [`Session`] is the unit of persisted conversational state, keyed by a
//! caller-assigned `session_id`. Stores are configured for exactly one
//! [`StorageMode`] and produce the matching specialization on read:
//! [`AgentSession`] carries the `agent_id`/`agent_data` pair,
//! [`WorkflowSession`] the `workflow_id`/`workflow_data` pair. The `memory`,
//! `session_data` and `extra_data` blobs are opaque to the engine and pass
//! through unmodified.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Which session specialization a store produces.
///
/// Fixed at construction; determines the mode-specific columns/fields of the
/// backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Sessions produced by agent runs (`agent_id` / `agent_data`)
    Agent,
    /// Sessions produced by workflow runs (`workflow_id` / `workflow_data`)
    Workflow,
}

impl StorageMode {
    /// Mode name as stored in logs and configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Workflow => "workflow",
        }
    }

    /// Name of the indexed entity id column for this mode.
    #[must_use]
    pub fn entity_id_column(self) -> &'static str {
        match self {
            Self::Agent => "agent_id",
            Self::Workflow => "workflow_id",
        }
    }

    /// Name of the entity data column for this mode.
    #[must_use]
    pub fn entity_data_column(self) -> &'static str {
        match self {
            Self::Agent => "agent_data",
            Self::Workflow => "workflow_data",
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session produced by an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    /// Session id: primary key, caller-assigned, immutable
    pub session_id: String,

    /// ID of the agent this session belongs to
    #[serde(default)]
    pub agent_id: Option<String>,

    /// ID of the user interacting with the agent
    #[serde(default)]
    pub user_id: Option<String>,

    /// Agent memory (opaque)
    #[serde(default)]
    pub memory: Option<Value>,

    /// Agent data (opaque)
    #[serde(default)]
    pub agent_data: Option<Value>,

    /// Session data: display name, UI state, attached media (opaque)
    #[serde(default)]
    pub session_data: Option<Value>,

    /// Extra data stored with the session (opaque)
    #[serde(default)]
    pub extra_data: Option<Value>,

    /// Unix timestamp of the first persist; write-once
    #[serde(default)]
    pub created_at: Option<i64>,

    /// Unix timestamp of the most recent persist
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl AgentSession {
    /// Create a new agent session with the given id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: None,
            user_id: None,
            memory: None,
            agent_data: None,
            session_data: None,
            extra_data: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Set the owning agent id.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the interacting user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the memory blob.
    #[must_use]
    pub fn with_memory(mut self, memory: Value) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the agent data blob.
    #[must_use]
    pub fn with_agent_data(mut self, agent_data: Value) -> Self {
        self.agent_data = Some(agent_data);
        self
    }

    /// Set the session data blob.
    #[must_use]
    pub fn with_session_data(mut self, session_data: Value) -> Self {
        self.session_data = Some(session_data);
        self
    }

    /// Set the extra data blob.
    #[must_use]
    pub fn with_extra_data(mut self, extra_data: Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }
}

/// A session produced by a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    /// Session id: primary key, caller-assigned, immutable
    pub session_id: String,

    /// ID of the workflow this session belongs to
    #[serde(default)]
    pub workflow_id: Option<String>,

    /// ID of the user interacting with the workflow
    #[serde(default)]
    pub user_id: Option<String>,

    /// Workflow memory (opaque)
    #[serde(default)]
    pub memory: Option<Value>,

    /// Workflow data (opaque)
    #[serde(default)]
    pub workflow_data: Option<Value>,

    /// Session data: display name, UI state, attached media (opaque)
    #[serde(default)]
    pub session_data: Option<Value>,

    /// Extra data stored with the session (opaque)
    #[serde(default)]
    pub extra_data: Option<Value>,

    /// Unix timestamp of the first persist; write-once
    #[serde(default)]
    pub created_at: Option<i64>,

    /// Unix timestamp of the most recent persist
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl WorkflowSession {
    /// Create a new workflow session with the given id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            workflow_id: None,
            user_id: None,
            memory: None,
            workflow_data: None,
            session_data: None,
            extra_data: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Set the owning workflow id.
    #[must_use]
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Set the interacting user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the memory blob.
    #[must_use]
    pub fn with_memory(mut self, memory: Value) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the workflow data blob.
    #[must_use]
    pub fn with_workflow_data(mut self, workflow_data: Value) -> Self {
        self.workflow_data = Some(workflow_data);
        self
    }

    /// Set the session data blob.
    #[must_use]
    pub fn with_session_data(mut self, session_data: Value) -> Self {
        self.session_data = Some(session_data);
        self
    }

    /// Set the extra data blob.
    #[must_use]
    pub fn with_extra_data(mut self, extra_data: Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }
}

/// A persisted session, in the specialization of the store that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Session {
    /// Agent-mode session
    Agent(AgentSession),
    /// Workflow-mode session
    Workflow(WorkflowSession),
}

/// Borrowed view of the fields every backend persists, with the
/// mode-specific pair flattened into entity slots.
#[derive(Debug)]
pub struct SessionColumns<'a> {
    /// Primary key
    pub session_id: &'a str,
    /// `agent_id` or `workflow_id`, depending on mode
    pub entity_id: Option<&'a str>,
    /// Interacting user id
    pub user_id: Option<&'a str>,
    /// Memory blob
    pub memory: Option<&'a Value>,
    /// `agent_data` or `workflow_data`, depending on mode
    pub entity_data: Option<&'a Value>,
    /// Session data blob
    pub session_data: Option<&'a Value>,
    /// Extra data blob
    pub extra_data: Option<&'a Value>,
    /// First-persist timestamp, if the caller carries one
    pub created_at: Option<i64>,
}

impl Session {
    /// The mode of the specialization this session carries.
    #[must_use]
    pub fn mode(&self) -> StorageMode {
        match self {
            Self::Agent(_) => StorageMode::Agent,
            Self::Workflow(_) => StorageMode::Workflow,
        }
    }

    /// The session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Agent(s) => &s.session_id,
            Self::Workflow(s) => &s.session_id,
        }
    }

    /// The interacting user id, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Agent(s) => s.user_id.as_deref(),
            Self::Workflow(s) => s.user_id.as_deref(),
        }
    }

    /// The agent or workflow id, if any.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::Agent(s) => s.agent_id.as_deref(),
            Self::Workflow(s) => s.workflow_id.as_deref(),
        }
    }

    /// The memory blob, if any.
    #[must_use]
    pub fn memory(&self) -> Option<&Value> {
        match self {
            Self::Agent(s) => s.memory.as_ref(),
            Self::Workflow(s) => s.memory.as_ref(),
        }
    }

    /// Unix timestamp of the first persist, if set.
    #[must_use]
    pub fn created_at(&self) -> Option<i64> {
        match self {
            Self::Agent(s) => s.created_at,
            Self::Workflow(s) => s.created_at,
        }
    }

    /// Unix timestamp of the most recent persist, if set.
    #[must_use]
    pub fn updated_at(&self) -> Option<i64> {
        match self {
            Self::Agent(s) => s.updated_at,
            Self::Workflow(s) => s.updated_at,
        }
    }

    /// Overwrite the first-persist timestamp.
    pub fn set_created_at(&mut self, ts: i64) {
        match self {
            Self::Agent(s) => s.created_at = Some(ts),
            Self::Workflow(s) => s.created_at = Some(ts),
        }
    }

    /// Overwrite the last-persist timestamp.
    pub fn set_updated_at(&mut self, ts: i64) {
        match self {
            Self::Agent(s) => s.updated_at = Some(ts),
            Self::Workflow(s) => s.updated_at = Some(ts),
        }
    }

    /// The persisted column view of this session.
    #[must_use]
    pub fn columns(&self) -> SessionColumns<'_> {
        match self {
            Self::Agent(s) => SessionColumns {
                session_id: &s.session_id,
                entity_id: s.agent_id.as_deref(),
                user_id: s.user_id.as_deref(),
                memory: s.memory.as_ref(),
                entity_data: s.agent_data.as_ref(),
                session_data: s.session_data.as_ref(),
                extra_data: s.extra_data.as_ref(),
                created_at: s.created_at,
            },
            Self::Workflow(s) => SessionColumns {
                session_id: &s.session_id,
                entity_id: s.workflow_id.as_deref(),
                user_id: s.user_id.as_deref(),
                memory: s.memory.as_ref(),
                entity_data: s.workflow_data.as_ref(),
                session_data: s.session_data.as_ref(),
                extra_data: s.extra_data.as_ref(),
                created_at: s.created_at,
            },
        }
    }

    /// Decode a serialized record into the specialization for `mode`.
    ///
    /// A record without a `session_id`, or one that does not parse, yields
    /// `None` with a logged warning rather than an error.
    #[must_use]
    pub fn from_value(mode: StorageMode, value: Value) -> Option<Self> {
        match value.get("session_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {}
            _ => {
                warn!(mode = %mode, "session record is missing session_id");
                return None;
            }
        }
        let decoded = match mode {
            StorageMode::Agent => serde_json::from_value(value).map(Self::Agent),
            StorageMode::Workflow => serde_json::from_value(value).map(Self::Workflow),
        };
        match decoded {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(mode = %mode, error = %e, "failed to decode session record");
                None
            }
        }
    }

    /// Full record as a JSON value, for monitoring export.
    #[must_use]
    pub fn monitoring_data(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Timestamps only, for telemetry export.
    #[must_use]
    pub fn telemetry_data(&self) -> Value {
        serde_json::json!({
            "created_at": self.created_at(),
            "updated_at": self.updated_at(),
        })
    }
}

impl From<AgentSession> for Session {
    fn from(session: AgentSession) -> Self {
        Self::Agent(session)
    }
}

impl From<WorkflowSession> for Session {
    fn from(session: WorkflowSession) -> Self {
        Self::Workflow(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_columns() {
        assert_eq!(StorageMode::Agent.entity_id_column(), "agent_id");
        assert_eq!(StorageMode::Agent.entity_data_column(), "agent_data");
        assert_eq!(StorageMode::Workflow.entity_id_column(), "workflow_id");
        assert_eq!(StorageMode::Workflow.entity_data_column(), "workflow_data");
    }

    #[test]
    fn test_builder_round_trip() {
        let session = AgentSession::new("s1")
            .with_agent_id("a1")
            .with_user_id("u1")
            .with_memory(json!({"a": 1}));

        let session = Session::from(session);
        assert_eq!(session.session_id(), "s1");
        assert_eq!(session.entity_id(), Some("a1"));
        assert_eq!(session.user_id(), Some("u1"));
        assert_eq!(session.memory(), Some(&json!({"a": 1})));
        assert_eq!(session.mode(), StorageMode::Agent);
    }

    #[test]
    fn test_columns_flatten_mode_pair() {
        let session = Session::from(
            WorkflowSession::new("s2")
                .with_workflow_id("w1")
                .with_workflow_data(json!({"step": 3})),
        );
        let cols = session.columns();
        assert_eq!(cols.session_id, "s2");
        assert_eq!(cols.entity_id, Some("w1"));
        assert_eq!(cols.entity_data, Some(&json!({"step": 3})));
    }

    #[test]
    fn test_from_value_requires_session_id() {
        assert!(Session::from_value(StorageMode::Agent, json!({"user_id": "u1"})).is_none());
        assert!(Session::from_value(StorageMode::Agent, json!({"session_id": ""})).is_none());

        let session =
            Session::from_value(StorageMode::Agent, json!({"session_id": "s1"})).unwrap();
        assert_eq!(session.session_id(), "s1");
        assert_eq!(session.mode(), StorageMode::Agent);
    }

    #[test]
    fn test_from_value_mode_selects_variant() {
        let value = json!({"session_id": "s1", "workflow_id": "w1"});
        let session = Session::from_value(StorageMode::Workflow, value).unwrap();
        assert_eq!(session.mode(), StorageMode::Workflow);
        assert_eq!(session.entity_id(), Some("w1"));
    }

    #[test]
    fn test_serialization_keeps_all_fields() {
        let session = Session::from(AgentSession::new("s1").with_user_id("u1"));
        let value = session.monitoring_data();
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["user_id"], "u1");
        // Unset blobs serialize as explicit nulls: documents carry the full record.
        assert!(value["memory"].is_null());
        assert!(value.get("agent_data").is_some());
    }

    #[test]
    fn test_telemetry_data() {
        let mut session = Session::from(AgentSession::new("s1"));
        session.set_created_at(100);
        session.set_updated_at(200);
        assert_eq!(
            session.telemetry_data(),
            json!({"created_at": 100, "updated_at": 200})
        );
    }
}

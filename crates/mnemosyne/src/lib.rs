//! Mnemosyne — Durable Session Storage for Agent Runtimes
//!
//! Persists the conversational state ("sessions") produced by autonomous
//! agent and workflow runs so a run can be resumed, listed, renamed, or
//! audited later. One contract, several backends:
//!
//! ```text
//!                 agent / workflow runtime
//!                           │
//!                    SessionStorage
//!                    ╱      │      ╲
//!          SqliteStorage PostgresStorage JsonStorage
//!           (embedded)     (server,      (one file
//!                          namespaced)   per session)
//! ```
//!
//! All backends share the [`Session`] data model and the same semantics:
//! atomic upsert keyed by `session_id` (write-once `created_at`, bumped
//! `updated_at`), filtered listing newest-first, lazy container creation
//! with a single guarded retry, and a fail-soft contract: runtime storage
//! failures are logged and degrade to `None`/empty rather than
//! interrupting the caller's run loop.
//!
//! # Example
//!
//! ```no_run
//! use mnemosyne::{AgentSession, Session, SessionStorage, SqliteStorage, StorageMode};
//!
//! # async fn demo() -> mnemosyne::Result<()> {
//! let store = SqliteStorage::from_path(
//!     std::path::Path::new("sessions.db"),
//!     "sessions",
//!     StorageMode::Agent,
//! )
//! .await?;
//!
//! let session = Session::from(
//!     AgentSession::new("s1")
//!         .with_user_id("u1")
//!         .with_memory(serde_json::json!({"topic": "pricing"})),
//! );
//! let persisted = store.upsert(&session).await;
//! let restored = store.read("s1", Some("u1")).await;
//! # let _ = (persisted, restored);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod session;
pub mod storage;

pub use error::{Error, Result};
pub use session::{AgentSession, Session, SessionColumns, StorageMode, WorkflowSession};
pub use storage::{JsonStorage, PostgresStorage, SessionStorage, SqliteStorage};

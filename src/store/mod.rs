//! Durable storage for sessions, events, artifacts and task bindings.
//!
//! Two backends are provided: an in-memory store (non-persistent, used by
//! tests and ephemeral dev runs) and a SQLite store.

mod memory;
mod sqlite;

pub use memory::InMemoryControlStore;
pub use sqlite::SqliteControlStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{StoreConfig, StoreType};
use crate::events::{EventPage, EventQuery, SessionEvent};
use crate::session::{RecoveryPatch, SandboxSession, SessionState, SessionUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// The row was not in one of the expected states.
    #[error("session {session_id} is {actual}, expected {expected}")]
    Conflict {
        session_id: String,
        expected: String,
        actual: SessionState,
    },

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Backend(_))
    }

    pub(crate) fn conflict(session_id: &str, allowed: &[SessionState], actual: SessionState) -> Self {
        Self::Conflict {
            session_id: session_id.to_string(),
            expected: allowed
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("|"),
            actual,
        }
    }
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub artifacts_dropped: usize,
    pub events_deleted: usize,
}

#[async_trait]
pub trait ControlStore: Send + Sync {
    fn is_persistent(&self) -> bool;

    /// Insert a new session. Fails with `Duplicate` if the id exists.
    async fn insert_session(&self, session: &SandboxSession) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SandboxSession>, StoreError>;

    /// Most recently updated first.
    async fn list_sessions(&self, limit: usize, offset: usize)
        -> Result<Vec<SandboxSession>, StoreError>;

    async fn list_active_sessions(&self) -> Result<Vec<SandboxSession>, StoreError>;

    /// Compare-and-set state transition.
    ///
    /// Applies `update` only if the current state is one of `allowed_from`,
    /// otherwise returns `Conflict` with the actual state. Assigning a
    /// sandbox id already held by another non-terminal session returns
    /// `Duplicate`.
    async fn transition_session(
        &self,
        session_id: &str,
        allowed_from: &[SessionState],
        update: &SessionUpdate,
    ) -> Result<SandboxSession, StoreError>;

    async fn update_recovery(
        &self,
        session_id: &str,
        patch: &RecoveryPatch,
    ) -> Result<SandboxSession, StoreError>;

    /// Compare-and-set the task binding.
    ///
    /// `expected` is the session the caller believes is currently bound
    /// (`None` meaning no binding). A mismatch returns `Conflict`.
    async fn bind_task(
        &self,
        task_id: &str,
        session_id: &str,
        expected: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn task_binding(&self, task_id: &str) -> Result<Option<String>, StoreError>;

    /// Persist an event (and its full artifact, if any) and bump the
    /// session's last activity in the same unit of work.
    async fn append_event(
        &self,
        event: &SessionEvent,
        artifact: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Highest sequence stored for the session, 0 if none.
    async fn max_sequence(&self, session_id: &str) -> Result<u64, StoreError>;

    async fn list_events(&self, session_id: &str, query: &EventQuery)
        -> Result<EventPage, StoreError>;

    async fn get_event(&self, event_id: Uuid) -> Result<Option<SessionEvent>, StoreError>;

    async fn get_artifact(&self, event_id: Uuid) -> Result<Option<String>, StoreError>;

    /// Drop artifacts of events older than `artifacts_before` and delete
    /// Tier-2 events older than `batched_before`. Tier-1 events are kept.
    async fn apply_retention(
        &self,
        artifacts_before: DateTime<Utc>,
        batched_before: DateTime<Utc>,
    ) -> Result<RetentionReport, StoreError>;
}

/// Build the configured store backend.
pub fn create_control_store(config: &StoreConfig) -> Result<Arc<dyn ControlStore>, StoreError> {
    match config.store_type {
        StoreType::Memory => {
            tracing::info!("Using in-memory control store (not persistent)");
            Ok(Arc::new(InMemoryControlStore::new()))
        }
        StoreType::Sqlite => {
            if let Some(parent) = config.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Backend(format!(
                            "failed to create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }
            tracing::info!(path = %config.db_path.display(), "Using SQLite control store");
            Ok(Arc::new(SqliteControlStore::open(&config.db_path)?))
        }
    }
}

/// Fixed-width RFC 3339 timestamp so stored strings sort chronologically.
pub fn timestamp_string(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_string() -> String {
    timestamp_string(Utc::now())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {value:?}: {e}")))
}

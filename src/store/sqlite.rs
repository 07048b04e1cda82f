//! SQLite-backed control store.
//!
//! A single connection guarded by a mutex; every call runs on the blocking
//! pool so the async runtime never waits on disk.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_timestamp, timestamp_string, ControlStore, RetentionReport, StoreError};
use crate::events::{EventPage, EventQuery, EventSource, EventType, SessionEvent, Tier};
use crate::session::{RecoveryPatch, RecoveryState, SandboxSession, SessionState, SessionUpdate};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    sandbox_id TEXT,
    state TEXT NOT NULL,
    labels TEXT NOT NULL DEFAULT '{}',
    resources TEXT NOT NULL DEFAULT 'null',
    recovery_state TEXT NOT NULL DEFAULT '{}',
    terminal_reason TEXT,
    restarted_from TEXT,
    replaced_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_sandbox
    ON sessions(sandbox_id)
    WHERE sandbox_id IS NOT NULL AND state NOT IN ('COMPLETED', 'FAILED');

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL REFERENCES sessions(session_id),
    sequence INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    tier INTEGER NOT NULL,
    source TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);

CREATE TABLE IF NOT EXISTS artifacts (
    event_id TEXT PRIMARY KEY NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_bindings (
    task_id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const SESSION_COLUMNS: &str = "session_id, task_id, sandbox_id, state, labels, resources, \
     recovery_state, terminal_reason, restarted_from, replaced_by, created_at, updated_at, \
     last_activity_at";

const EVENT_COLUMNS: &str =
    "event_id, session_id, sequence, event_type, tier, source, payload, created_at";

#[derive(Clone)]
pub struct SqliteControlStore {
    conn: Arc<StdMutex<Connection>>,
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn decode_err(column: usize, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(err.to_string()),
    )
}

impl SqliteControlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(backend)?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("connection lock poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }

    fn map_session(row: &Row<'_>) -> rusqlite::Result<SandboxSession> {
        let state: String = row.get(3)?;
        let labels: String = row.get(4)?;
        let resources: String = row.get(5)?;
        let recovery: String = row.get(6)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;
        let last_activity_at: String = row.get(12)?;
        Ok(SandboxSession {
            session_id: row.get(0)?,
            task_id: row.get(1)?,
            sandbox_id: row.get(2)?,
            state: SessionState::parse(&state)
                .ok_or_else(|| decode_err(3, format!("unknown state {state}")))?,
            labels: serde_json::from_str(&labels).map_err(|e| decode_err(4, e))?,
            resources: serde_json::from_str(&resources).map_err(|e| decode_err(5, e))?,
            recovery_state: serde_json::from_str::<RecoveryState>(&recovery)
                .map_err(|e| decode_err(6, e))?,
            terminal_reason: row.get(7)?,
            restarted_from: row.get(8)?,
            replaced_by: row.get(9)?,
            created_at: parse_timestamp(&created_at).map_err(|e| decode_err(10, e))?,
            updated_at: parse_timestamp(&updated_at).map_err(|e| decode_err(11, e))?,
            last_activity_at: parse_timestamp(&last_activity_at)
                .map_err(|e| decode_err(12, e))?,
        })
    }

    fn map_event(row: &Row<'_>) -> rusqlite::Result<SessionEvent> {
        let event_id: String = row.get(0)?;
        let sequence: i64 = row.get(2)?;
        let event_type: String = row.get(3)?;
        let tier: i64 = row.get(4)?;
        let source: String = row.get(5)?;
        let payload: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let event_type = EventType::parse(&event_type)
            .ok_or_else(|| decode_err(3, format!("unknown event type {event_type}")))?;
        Ok(SessionEvent {
            event_id: Uuid::parse_str(&event_id).map_err(|e| decode_err(0, e))?,
            session_id: row.get(1)?,
            sequence: u64::try_from(sequence).map_err(|e| decode_err(2, e))?,
            event_type,
            category: event_type.category(),
            tier: Tier::from_i64(tier).ok_or_else(|| decode_err(4, format!("bad tier {tier}")))?,
            source: EventSource::parse(&source)
                .ok_or_else(|| decode_err(5, format!("bad source {source}")))?,
            payload: serde_json::from_str(&payload).map_err(|e| decode_err(6, e))?,
            created_at: parse_timestamp(&created_at).map_err(|e| decode_err(7, e))?,
        })
    }

    fn load_session(conn: &Connection, session_id: &str) -> Result<Option<SandboxSession>, StoreError> {
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
            params![session_id],
            Self::map_session,
        )
        .optional()
        .map_err(backend)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(backend)
}

#[async_trait]
impl ControlStore for SqliteControlStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert_session(&self, session: &SandboxSession) -> Result<(), StoreError> {
        let session = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    session.session_id,
                    session.task_id,
                    session.sandbox_id,
                    session.state.as_str(),
                    to_json(&session.labels)?,
                    to_json(&session.resources)?,
                    to_json(&session.recovery_state)?,
                    session.terminal_reason,
                    session.restarted_from,
                    session.replaced_by,
                    timestamp_string(session.created_at),
                    timestamp_string(session.updated_at),
                    timestamp_string(session.last_activity_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Duplicate(format!("session {}", session.session_id))
                } else {
                    backend(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SandboxSession>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| Self::load_session(conn, &session_id))
            .await
    }

    async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SandboxSession>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], Self::map_session)
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }

    async fn list_active_sessions(&self) -> Result<Vec<SandboxSession>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE state NOT IN ('COMPLETED', 'FAILED') ORDER BY created_at ASC"
                ))
                .map_err(backend)?;
            let rows = stmt.query_map([], Self::map_session).map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }

    async fn transition_session(
        &self,
        session_id: &str,
        allowed_from: &[SessionState],
        update: &SessionUpdate,
    ) -> Result<SandboxSession, StoreError> {
        let session_id = session_id.to_string();
        let allowed_from = allowed_from.to_vec();
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let current = Self::load_session(&tx, &session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
            if !allowed_from.contains(&current.state) {
                return Err(StoreError::conflict(&session_id, &allowed_from, current.state));
            }
            tx.execute(
                "UPDATE sessions SET state = ?2, \
                     sandbox_id = COALESCE(?3, sandbox_id), \
                     terminal_reason = COALESCE(?4, terminal_reason), \
                     replaced_by = COALESCE(?5, replaced_by), \
                     updated_at = ?6 \
                 WHERE session_id = ?1 AND state = ?7",
                params![
                    session_id,
                    update.target.as_str(),
                    update.sandbox_id,
                    update.terminal_reason,
                    update.replaced_by,
                    timestamp_string(Utc::now()),
                    current.state.as_str(),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Duplicate(format!(
                        "sandbox {} is held by another live session",
                        update.sandbox_id.as_deref().unwrap_or_default()
                    ))
                } else {
                    backend(e)
                }
            })?;
            let updated = Self::load_session(&tx, &session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
            tx.commit().map_err(backend)?;
            Ok(updated)
        })
        .await
    }

    async fn update_recovery(
        &self,
        session_id: &str,
        patch: &RecoveryPatch,
    ) -> Result<SandboxSession, StoreError> {
        let session_id = session_id.to_string();
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let mut session = Self::load_session(&tx, &session_id)?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
            session.recovery_state.apply(&patch);
            session.updated_at = Utc::now();
            tx.execute(
                "UPDATE sessions SET recovery_state = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![
                    session_id,
                    to_json(&session.recovery_state)?,
                    timestamp_string(session.updated_at),
                ],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(session)
        })
        .await
    }

    async fn bind_task(
        &self,
        task_id: &str,
        session_id: &str,
        expected: Option<&str>,
    ) -> Result<(), StoreError> {
        let task_id = task_id.to_string();
        let session_id = session_id.to_string();
        let expected = expected.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT session_id FROM task_bindings WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            if current != expected {
                let actual = match &current {
                    Some(bound) => Self::load_session(&tx, bound)?
                        .map(|s| s.state)
                        .unwrap_or(SessionState::Failed),
                    None => SessionState::Pending,
                };
                return Err(StoreError::Conflict {
                    session_id,
                    expected: format!(
                        "task {task_id} bound to {}",
                        expected.as_deref().unwrap_or("nothing")
                    ),
                    actual,
                });
            }
            tx.execute(
                "INSERT INTO task_bindings (task_id, session_id, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(task_id) DO UPDATE SET session_id = excluded.session_id, \
                 updated_at = excluded.updated_at",
                params![task_id, session_id, timestamp_string(Utc::now())],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn task_binding(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT session_id FROM task_bindings WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn append_event(
        &self,
        event: &SessionEvent,
        artifact: Option<&str>,
    ) -> Result<(), StoreError> {
        let event = event.clone();
        let artifact = artifact.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let created_at = timestamp_string(event.created_at);
            let touched = tx
                .execute(
                    "UPDATE sessions SET last_activity_at = MAX(last_activity_at, ?2) \
                     WHERE session_id = ?1",
                    params![event.session_id, created_at],
                )
                .map_err(backend)?;
            if touched == 0 {
                return Err(StoreError::NotFound(format!("session {}", event.session_id)));
            }
            tx.execute(
                &format!(
                    "INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    event.event_id.to_string(),
                    event.session_id,
                    event.sequence as i64,
                    event.event_type.as_str(),
                    event.tier.as_i64(),
                    event.source.as_str(),
                    to_json(&event.payload)?,
                    created_at,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Duplicate(format!(
                        "sequence {} for session {}",
                        event.sequence, event.session_id
                    ))
                } else {
                    backend(e)
                }
            })?;
            if let Some(content) = artifact {
                tx.execute(
                    "INSERT INTO artifacts (event_id, content) VALUES (?1, ?2)",
                    params![event.event_id.to_string(), content],
                )
                .map_err(backend)?;
            }
            tx.commit().map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn max_sequence(&self, session_id: &str) -> Result<u64, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn
                .query_row(
                    "SELECT MAX(sequence) FROM events WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .map_err(backend)?;
            Ok(max.map(|m| m.max(0) as u64).unwrap_or(0))
        })
        .await
    }

    async fn list_events(
        &self,
        session_id: &str,
        query: &EventQuery,
    ) -> Result<EventPage, StoreError> {
        let session_id = session_id.to_string();
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut filter = String::from("session_id = ?1 AND sequence > ?2");
            if let Some(types) = &query.event_types {
                if types.is_empty() {
                    return Ok(EventPage {
                        events: Vec::new(),
                        total_count: 0,
                    });
                }
                let names = types
                    .iter()
                    .map(|t| format!("'{}'", t.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ");
                filter.push_str(&format!(" AND event_type IN ({names})"));
            }
            let after = query.after_sequence.unwrap_or(0) as i64;

            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM events WHERE {filter}"),
                    params![session_id, after],
                    |row| row.get(0),
                )
                .map_err(backend)?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE {filter} \
                     ORDER BY sequence ASC LIMIT ?3 OFFSET ?4"
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(
                    params![session_id, after, query.limit as i64, query.offset as i64],
                    Self::map_event,
                )
                .map_err(backend)?;
            let events = rows.collect::<Result<Vec<_>, _>>().map_err(backend)?;
            Ok(EventPage {
                events,
                total_count: total.max(0) as usize,
            })
        })
        .await
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<SessionEvent>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
                params![event_id.to_string()],
                Self::map_event,
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn get_artifact(&self, event_id: Uuid) -> Result<Option<String>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT content FROM artifacts WHERE event_id = ?1",
                params![event_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
        })
        .await
    }

    async fn apply_retention(
        &self,
        artifacts_before: DateTime<Utc>,
        batched_before: DateTime<Utc>,
    ) -> Result<RetentionReport, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let artifacts_dropped = tx
                .execute(
                    "DELETE FROM artifacts WHERE event_id IN \
                     (SELECT event_id FROM events WHERE created_at < ?1)",
                    params![timestamp_string(artifacts_before)],
                )
                .map_err(backend)?;
            let events_deleted = tx
                .execute(
                    "DELETE FROM events WHERE tier = ?1 AND created_at < ?2",
                    params![Tier::Batched.as_i64(), timestamp_string(batched_before)],
                )
                .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(RetentionReport {
                artifacts_dropped,
                events_deleted,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{NewSession, Transition};

    fn session(task: &str) -> SandboxSession {
        SandboxSession::new(NewSession {
            task_id: task.to_string(),
            labels: [("repo".to_string(), "acme/web".to_string())].into(),
            ..Default::default()
        })
    }

    fn event(session_id: &str, sequence: u64, event_type: EventType) -> SessionEvent {
        SessionEvent {
            event_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            sequence,
            event_type,
            category: event_type.category(),
            tier: event_type.tier(),
            source: EventSource::Agent,
            payload: serde_json::json!({"n": sequence}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.db");
        let s = session("t1");
        {
            let store = SqliteControlStore::open(&path).unwrap();
            store.insert_session(&s).await.unwrap();
            store
                .append_event(&event(&s.session_id, 1, EventType::AgentStarted), None)
                .await
                .unwrap();
        }
        let store = SqliteControlStore::open(&path).unwrap();
        let loaded = store.get_session(&s.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, "t1");
        assert_eq!(loaded.labels.get("repo").map(String::as_str), Some("acme/web"));
        assert_eq!(store.max_sequence(&s.session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transition_conflict_reports_actual_state() {
        let store = SqliteControlStore::in_memory().unwrap();
        let s = session("t1");
        store.insert_session(&s).await.unwrap();
        let t = Transition::Activated;
        let err = store
            .transition_session(&s.session_id, t.allowed_from(), &t.to_update())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                actual: SessionState::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn live_sandbox_ids_are_unique_but_reusable_after_terminal() {
        let store = SqliteControlStore::in_memory().unwrap();
        let a = session("t1");
        let b = session("t2");
        store.insert_session(&a).await.unwrap();
        store.insert_session(&b).await.unwrap();
        let provisioned = Transition::Provisioned {
            sandbox_id: "sbx-1".into(),
        };
        store
            .transition_session(&a.session_id, provisioned.allowed_from(), &provisioned.to_update())
            .await
            .unwrap();
        let err = store
            .transition_session(&b.session_id, provisioned.allowed_from(), &provisioned.to_update())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        let failed = Transition::CreationTimedOut;
        store
            .transition_session(&a.session_id, failed.allowed_from(), &failed.to_update())
            .await
            .unwrap();
        store
            .transition_session(&b.session_id, provisioned.allowed_from(), &provisioned.to_update())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn events_require_existing_session_and_unique_sequence() {
        let store = SqliteControlStore::in_memory().unwrap();
        let err = store
            .append_event(&event("ghost", 1, EventType::Info), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let s = session("t1");
        store.insert_session(&s).await.unwrap();
        store
            .append_event(&event(&s.session_id, 1, EventType::Info), None)
            .await
            .unwrap();
        let err = store
            .append_event(&event(&s.session_id, 1, EventType::Info), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn list_events_filters_by_type_and_pages() {
        let store = SqliteControlStore::in_memory().unwrap();
        let s = session("t1");
        store.insert_session(&s).await.unwrap();
        for (seq, event_type) in [
            (1, EventType::AgentStarted),
            (2, EventType::ToolUse),
            (3, EventType::ToolUse),
            (4, EventType::AgentCompleted),
        ] {
            store
                .append_event(&event(&s.session_id, seq, event_type), None)
                .await
                .unwrap();
        }
        let page = store
            .list_events(
                &s.session_id,
                &EventQuery {
                    event_types: Some(vec![EventType::ToolUse]),
                    limit: 1,
                    offset: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].sequence, 3);
    }

    #[tokio::test]
    async fn retention_drops_artifacts_and_batched_events() {
        let store = SqliteControlStore::in_memory().unwrap();
        let s = session("t1");
        store.insert_session(&s).await.unwrap();
        let edit = event(&s.session_id, 1, EventType::FileEdited);
        store.append_event(&edit, Some("diff --git a b")).await.unwrap();
        store
            .append_event(&event(&s.session_id, 2, EventType::Thinking), None)
            .await
            .unwrap();
        assert!(store.get_artifact(edit.event_id).await.unwrap().is_some());

        let later = Utc::now() + chrono::Duration::seconds(1);
        let report = store.apply_retention(later, later).await.unwrap();
        assert_eq!(
            report,
            RetentionReport {
                artifacts_dropped: 1,
                events_deleted: 1
            }
        );
        assert!(store.get_artifact(edit.event_id).await.unwrap().is_none());
        assert!(store.get_event(edit.event_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recovery_patch_persists() {
        let store = SqliteControlStore::in_memory().unwrap();
        let s = session("t1");
        store.insert_session(&s).await.unwrap();
        store
            .update_recovery(
                &s.session_id,
                &RecoveryPatch {
                    pushed: Some(true),
                    branch_name: Some("fix/login".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let loaded = store.get_session(&s.session_id).await.unwrap().unwrap();
        assert!(loaded.recovery_state.pushed);
        assert_eq!(loaded.recovery_state.branch_name.as_deref(), Some("fix/login"));
    }
}

//! In-memory control store (non-persistent).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ControlStore, RetentionReport, StoreError};
use crate::events::{EventPage, EventQuery, SessionEvent, Tier};
use crate::session::{RecoveryPatch, SandboxSession, SessionState, SessionUpdate};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SandboxSession>,
    /// Per-session events ordered by sequence.
    events: HashMap<String, Vec<SessionEvent>>,
    event_index: HashMap<Uuid, String>,
    artifacts: HashMap<Uuid, String>,
    bindings: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct InMemoryControlStore {
    inner: Arc<RwLock<Inner>>,
    failing_appends: Arc<AtomicU32>,
}

impl InMemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` event appends fail with a backend error.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ControlStore for InMemoryControlStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert_session(&self, session: &SandboxSession) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Duplicate(format!(
                "session {}",
                session.session_id
            )));
        }
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SandboxSession>, StoreError> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SandboxSession>, StoreError> {
        let mut sessions: Vec<SandboxSession> =
            self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_active_sessions(&self) -> Result<Vec<SandboxSession>, StoreError> {
        let mut sessions: Vec<SandboxSession> = self
            .inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn transition_session(
        &self,
        session_id: &str,
        allowed_from: &[SessionState],
        update: &SessionUpdate,
    ) -> Result<SandboxSession, StoreError> {
        let mut inner = self.inner.write().await;
        let current = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        if !allowed_from.contains(&current.state) {
            return Err(StoreError::conflict(session_id, allowed_from, current.state));
        }
        if let Some(sandbox_id) = &update.sandbox_id {
            let taken = inner.sessions.values().any(|s| {
                s.session_id != session_id
                    && !s.is_terminal()
                    && s.sandbox_id.as_deref() == Some(sandbox_id.as_str())
            });
            if taken {
                return Err(StoreError::Duplicate(format!(
                    "sandbox {sandbox_id} is held by another live session"
                )));
            }
        }
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        session.state = update.target;
        if let Some(sandbox_id) = &update.sandbox_id {
            session.sandbox_id = Some(sandbox_id.clone());
        }
        if let Some(reason) = &update.terminal_reason {
            session.terminal_reason = Some(reason.clone());
        }
        if let Some(replacement) = &update.replaced_by {
            session.replaced_by = Some(replacement.clone());
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn update_recovery(
        &self,
        session_id: &str,
        patch: &RecoveryPatch,
    ) -> Result<SandboxSession, StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        session.recovery_state.apply(patch);
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn bind_task(
        &self,
        task_id: &str,
        session_id: &str,
        expected: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let current = inner.bindings.get(task_id).map(String::as_str);
        if current != expected {
            let actual = match current {
                Some(bound) => inner
                    .sessions
                    .get(bound)
                    .map(|s| s.state)
                    .unwrap_or(SessionState::Failed),
                None => SessionState::Pending,
            };
            return Err(StoreError::Conflict {
                session_id: session_id.to_string(),
                expected: format!("task {task_id} bound to {}", expected.unwrap_or("nothing")),
                actual,
            });
        }
        inner
            .bindings
            .insert(task_id.to_string(), session_id.to_string());
        Ok(())
    }

    async fn task_binding(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.bindings.get(task_id).cloned())
    }

    async fn append_event(
        &self,
        event: &SessionEvent,
        artifact: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Backend("injected append failure".to_string()));
        }
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&event.session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", event.session_id)))?;
        if event.created_at > session.last_activity_at {
            session.last_activity_at = event.created_at;
        }
        let events = inner.events.entry(event.session_id.clone()).or_default();
        if events.iter().any(|e| e.sequence == event.sequence) {
            return Err(StoreError::Duplicate(format!(
                "sequence {} for session {}",
                event.sequence, event.session_id
            )));
        }
        events.push(event.clone());
        inner
            .event_index
            .insert(event.event_id, event.session_id.clone());
        if let Some(content) = artifact {
            inner.artifacts.insert(event.event_id, content.to_string());
        }
        Ok(())
    }

    async fn max_sequence(&self, session_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .get(session_id)
            .and_then(|events| events.iter().map(|e| e.sequence).max())
            .unwrap_or(0))
    }

    async fn list_events(
        &self,
        session_id: &str,
        query: &EventQuery,
    ) -> Result<EventPage, StoreError> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&SessionEvent> = inner
            .events
            .get(session_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        query
                            .event_types
                            .as_ref()
                            .map_or(true, |types| types.contains(&e.event_type))
                    })
                    .filter(|e| query.after_sequence.map_or(true, |after| e.sequence > after))
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|e| e.sequence);
        let total_count = matching.len();
        let events = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();
        Ok(EventPage {
            events,
            total_count,
        })
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<SessionEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.event_index.get(&event_id).and_then(|session_id| {
            inner
                .events
                .get(session_id)
                .and_then(|events| events.iter().find(|e| e.event_id == event_id).cloned())
        }))
    }

    async fn get_artifact(&self, event_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.artifacts.get(&event_id).cloned())
    }

    async fn apply_retention(
        &self,
        artifacts_before: DateTime<Utc>,
        batched_before: DateTime<Utc>,
    ) -> Result<RetentionReport, StoreError> {
        let mut inner = self.inner.write().await;
        let mut report = RetentionReport::default();

        let mut expired_artifacts = Vec::new();
        let mut deleted = Vec::new();
        for events in inner.events.values_mut() {
            for event in events.iter() {
                if event.created_at < artifacts_before {
                    expired_artifacts.push(event.event_id);
                }
            }
            events.retain(|event| {
                let drop = event.tier == Tier::Batched && event.created_at < batched_before;
                if drop {
                    deleted.push(event.event_id);
                }
                !drop
            });
        }
        for event_id in expired_artifacts {
            if inner.artifacts.remove(&event_id).is_some() {
                report.artifacts_dropped += 1;
            }
        }
        for event_id in deleted {
            inner.event_index.remove(&event_id);
            inner.artifacts.remove(&event_id);
            report.events_deleted += 1;
        }
        Ok(report)
    }
}

//! Authoritative session registry.
//!
//! All state changes go through [`SessionRegistry::transition`], which takes
//! the per-session lock and performs a compare-and-set in the store. Observers
//! registered here are told about creations and transitions while the lock
//! is still held, so per-session resources (queues, batchers, rate windows)
//! are torn down before any other caller can observe the terminal state.

use std::future::Future;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{NewSession, RecoveryPatch, SandboxSession, SessionState, Transition};
use crate::error::ControlError;
use crate::store::{ControlStore, StoreError};

/// Reacts to session lifecycle changes.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_created(&self, _session: &SandboxSession) {}

    async fn on_transition(
        &self,
        session: &SandboxSession,
        from: SessionState,
        transition: &Transition,
    );
}

/// Exclusive hold on one session's mutations.
pub struct SessionGuard {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct SessionRegistry {
    store: Arc<dyn ControlStore>,
    call_timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
    observers: StdRwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ControlStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
            locks: DashMap::new(),
            observers: StdRwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ControlStore> {
        &self.store
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }

    /// Serialize mutations of one session.
    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        let mutex = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SessionGuard {
            session_id: session_id.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Create a PENDING session without touching task bindings.
    pub async fn create(&self, spec: NewSession) -> Result<SandboxSession, ControlError> {
        if spec.task_id.trim().is_empty() {
            return Err(ControlError::validation("task_id must not be empty"));
        }
        let session = SandboxSession::new(spec);
        self.call(self.store.insert_session(&session)).await?;
        tracing::info!(
            session_id = %session.session_id,
            task_id = %session.task_id,
            restarted_from = ?session.restarted_from,
            "Session created"
        );
        for observer in self.observers() {
            observer.on_created(&session).await;
        }
        Ok(session)
    }

    /// Create a session and bind its task to it.
    ///
    /// A task may only have one live session; a stale binding to a terminal
    /// session is replaced.
    pub async fn create_for_task(&self, spec: NewSession) -> Result<SandboxSession, ControlError> {
        let task_id = spec.task_id.clone();
        let previous = self.call(self.store.task_binding(&task_id)).await?;
        if let Some(bound) = &previous {
            if let Some(existing) = self.find(bound).await? {
                if !existing.is_terminal() {
                    return Err(ControlError::validation(format!(
                        "task {task_id} already has live session {bound}"
                    )));
                }
            }
        }
        let session = self.create(spec).await?;
        self.bind_task(&task_id, &session.session_id, previous.as_deref())
            .await?;
        Ok(session)
    }

    /// Compare-and-set the task binding.
    pub async fn bind_task(
        &self,
        task_id: &str,
        session_id: &str,
        expected: Option<&str>,
    ) -> Result<(), ControlError> {
        self.call(self.store.bind_task(task_id, session_id, expected))
            .await?;
        tracing::debug!(task_id, session_id, previous = ?expected, "Task bound");
        Ok(())
    }

    pub async fn task_binding(&self, task_id: &str) -> Result<Option<String>, ControlError> {
        Ok(self.call(self.store.task_binding(task_id)).await?)
    }

    pub async fn find(&self, session_id: &str) -> Result<Option<SandboxSession>, ControlError> {
        Ok(self.call(self.store.get_session(session_id)).await?)
    }

    pub async fn get(&self, session_id: &str) -> Result<SandboxSession, ControlError> {
        self.find(session_id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("session {session_id}")))
    }

    pub async fn list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SandboxSession>, ControlError> {
        Ok(self.call(self.store.list_sessions(limit, offset)).await?)
    }

    pub async fn list_active(&self) -> Result<Vec<SandboxSession>, ControlError> {
        Ok(self.call(self.store.list_active_sessions()).await?)
    }

    pub async fn transition(
        &self,
        session_id: &str,
        transition: Transition,
    ) -> Result<SandboxSession, ControlError> {
        let guard = self.lock(session_id).await;
        self.transition_locked(&guard, transition).await
    }

    /// Apply a transition while already holding the session's lock.
    pub async fn transition_locked(
        &self,
        guard: &SessionGuard,
        transition: Transition,
    ) -> Result<SandboxSession, ControlError> {
        let session_id = guard.session_id();
        let before = self.get(session_id).await?;
        let updated = self
            .call(self.store.transition_session(
                session_id,
                transition.allowed_from(),
                &transition.to_update(),
            ))
            .await
            .map_err(|err| {
                if let StoreError::Conflict { actual, .. } = &err {
                    tracing::debug!(
                        session_id,
                        transition = transition.name(),
                        actual = %actual,
                        "Transition rejected"
                    );
                }
                ControlError::from(err)
            })?;

        tracing::info!(
            session_id,
            task_id = %updated.task_id,
            from = %before.state,
            to = %updated.state,
            cause = transition.name(),
            "Session state changed"
        );

        for observer in self.observers() {
            observer.on_transition(&updated, before.state, &transition).await;
        }
        if updated.is_terminal() {
            self.locks.remove(session_id);
        }
        Ok(updated)
    }

    pub async fn update_recovery(
        &self,
        session_id: &str,
        patch: &RecoveryPatch,
    ) -> Result<SandboxSession, ControlError> {
        let _guard = self.lock(session_id).await;
        let session = self
            .call(self.store.update_recovery(session_id, patch))
            .await?;
        tracing::debug!(session_id, recovery = ?session.recovery_state, "Recovery state updated");
        Ok(session)
    }
}

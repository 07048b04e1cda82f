//! Heartbeat & fault recovery supervisor.
//!
//! A fixed tick walks every non-terminal session and compares the time since
//! it was last heard from against a TTL that depends on what the worker says
//! it is doing. The escalation ladder is:
//!
//! 1. Each newly missed interval below the threshold is logged once.
//! 2. At the threshold the session is declared unresponsive and one restart
//!    cycle runs in the background: graceful stop, force stop on timeout,
//!    new sandbox for the same task, task rebind, `session.restarted` event.
//!
//! Sessions that keep heartbeating but report no work for longer than the
//! idle reap period are failed and stopped instead of restarted.
//!
//! Provisioner calls never run on the tick; they are spawned and each one is
//! bounded by a timeout.

pub mod liveness;
mod retention;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use liveness::{Liveness, LivenessTracker, WorkerActivity};
pub use retention::spawn_retention_sweep;

use crate::config::SupervisorConfig;
use crate::error::ControlError;
use crate::events::EventType;
use crate::guard::Authenticator;
use crate::ingest::IngestPipeline;
use crate::provisioner::{Provisioner, SandboxSpec};
use crate::session::{
    NewSession, SandboxSession, SessionObserver, SessionRegistry, SessionState, Transition,
};

pub struct HeartbeatSupervisor {
    config: SupervisorConfig,
    registry: Arc<SessionRegistry>,
    liveness: Arc<LivenessTracker>,
    provisioner: Arc<dyn Provisioner>,
    pipeline: Arc<IngestPipeline>,
    auth: Arc<Authenticator>,
    /// Sessions with a restart cycle in flight; at most one per session.
    restarting: DashMap<String, ()>,
    background: StdMutex<JoinSet<()>>,
}

/// What the tick decided for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Missed(u32),
    Unresponsive(u32),
    Idle,
    CreationTimedOut,
}

impl HeartbeatSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<SessionRegistry>,
        liveness: Arc<LivenessTracker>,
        provisioner: Arc<dyn Provisioner>,
        pipeline: Arc<IngestPipeline>,
        auth: Arc<Authenticator>,
    ) -> Self {
        Self {
            config,
            registry,
            liveness,
            provisioner,
            pipeline,
            auth,
            restarting: DashMap::new(),
            background: StdMutex::new(JoinSet::new()),
        }
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    /// Run the tick loop until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                tick_secs = this.config.tick_interval.as_secs(),
                running_ttl_secs = this.config.running_ttl.as_secs(),
                missed_threshold = this.config.missed_threshold,
                "Heartbeat supervisor started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => this.tick().await,
                }
            }
            tracing::info!("Heartbeat supervisor stopped");
        })
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut set = match self.background.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Wait for every restart, reap and provisioning job started so far.
    pub async fn settle(&self) {
        let mut set = match self.background.lock() {
            Ok(mut set) => std::mem::take(&mut *set),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        while let Some(result) = set.join_next().await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "Supervisor job ended abnormally");
            }
        }
    }

    /// Re-register sessions left active by a previous run of the control
    /// plane, keeping the silence they accumulated while it was down.
    pub async fn recover(&self) -> Result<usize, ControlError> {
        let sessions = self.registry.list_active().await?;
        let now = Utc::now();
        let mut restored = 0;
        for session in sessions {
            if session.state == SessionState::Pending {
                // The provisioning job died with the previous process.
                let result = self
                    .fail_provisioning(
                        &session.session_id,
                        "control plane restarted before provisioning completed".to_string(),
                    )
                    .await;
                if let Err(err) = result {
                    tracing::warn!(session_id = %session.session_id, error = %err, "Startup recovery: could not fail pending session");
                }
                continue;
            }
            let silent_for = (now - session.last_activity_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.liveness.restore(&session.session_id, silent_for);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(restored, "Startup recovery: resumed liveness tracking");
        }
        Ok(restored)
    }

    /// One supervision pass over all non-terminal sessions.
    pub async fn tick(self: &Arc<Self>) {
        let sessions = match self.registry.list_active().await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(error = %err, "Supervisor tick could not list sessions");
                return;
            }
        };
        for session in sessions {
            match self.judge(&session) {
                Verdict::Healthy => {}
                Verdict::Missed(misses) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        task_id = %session.task_id,
                        misses,
                        threshold = self.config.missed_threshold,
                        "Session missed heartbeat interval"
                    );
                    self.liveness.set_warned(&session.session_id, misses);
                }
                Verdict::Unresponsive(misses) => self.begin_restart(session, misses),
                Verdict::Idle => self.begin_reap(session),
                Verdict::CreationTimedOut => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        timeout_secs = self.config.creation_timeout.as_secs(),
                        "Session never became active"
                    );
                    if let Err(err) = self
                        .registry
                        .transition(&session.session_id, Transition::CreationTimedOut)
                        .await
                    {
                        tracing::debug!(session_id = %session.session_id, error = %err, "Creation timeout transition skipped");
                        continue;
                    }
                    self.release_sandbox(&session);
                }
            }
        }
    }

    fn judge(&self, session: &SandboxSession) -> Verdict {
        let Some(entry) = self.liveness.snapshot(&session.session_id) else {
            // Tracking is lost only across restarts; start the clock now.
            self.liveness.ensure(&session.session_id);
            return Verdict::Healthy;
        };
        match session.state {
            SessionState::Creating => {
                if entry.registered_at.elapsed() >= self.config.creation_timeout {
                    Verdict::CreationTimedOut
                } else {
                    Verdict::Healthy
                }
            }
            SessionState::Running => {
                let ttl = if entry.activity.is_idle() {
                    self.config.idle_ttl
                } else {
                    self.config.running_ttl
                };
                let misses = missed_intervals(entry.last_seen.elapsed(), ttl);
                if misses >= self.config.missed_threshold {
                    Verdict::Unresponsive(misses)
                } else if misses > entry.warned_misses {
                    Verdict::Missed(misses)
                } else if misses == 0
                    && entry.activity.is_idle()
                    && entry.last_work.elapsed() >= self.config.idle_reap_after
                {
                    Verdict::Idle
                } else {
                    Verdict::Healthy
                }
            }
            // PENDING is owned by the provisioning job, COMPLETING by the
            // finalization flow.
            _ => Verdict::Healthy,
        }
    }

    fn begin_restart(self: &Arc<Self>, session: SandboxSession, misses: u32) {
        if self.restarting.insert(session.session_id.clone(), ()).is_some() {
            return;
        }
        let this = Arc::clone(self);
        self.spawn_background(async move {
            let session_id = session.session_id.clone();
            this.restart(session, misses).await;
            this.restarting.remove(&session_id);
        });
    }

    fn begin_reap(self: &Arc<Self>, session: SandboxSession) {
        if self.restarting.contains_key(&session.session_id) {
            return;
        }
        let this = Arc::clone(self);
        self.spawn_background(async move {
            this.reap_idle(session).await;
        });
    }

    async fn reap_idle(&self, session: SandboxSession) {
        let idle_secs = self.config.idle_reap_after.as_secs();
        if let Err(err) = self
            .registry
            .transition(&session.session_id, Transition::IdleReaped)
            .await
        {
            tracing::debug!(session_id = %session.session_id, error = %err, "Idle reap skipped");
            return;
        }
        tracing::warn!(
            session_id = %session.session_id,
            task_id = %session.task_id,
            idle_secs,
            "Idle session terminated"
        );
        if let Some(sandbox_id) = &session.sandbox_id {
            self.stop_sandbox(sandbox_id).await;
        }
    }

    /// Declare a session unresponsive and replace it.
    async fn restart(&self, session: SandboxSession, misses: u32) {
        let old_id = session.session_id.clone();
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.restart_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let recent = session.recovery_state.restarts_since(now - window);
        let reason = format!("unresponsive: missed {misses} heartbeat intervals");

        if recent >= self.config.max_restarts as usize {
            tracing::error!(
                session_id = %old_id,
                task_id = %session.task_id,
                recent_restarts = recent,
                max_restarts = self.config.max_restarts,
                "Restart budget exhausted; failing session"
            );
            self.report_error(
                &old_id,
                json!({
                    "error": "restart budget exhausted",
                    "reason": reason,
                    "recent_restarts": recent,
                    "window_secs": self.config.restart_window.as_secs(),
                }),
            )
            .await;
            let failed = self
                .registry
                .transition(
                    &old_id,
                    Transition::Unresponsive {
                        reason: format!("{reason}; restart budget exhausted"),
                        replaced_by: None,
                    },
                )
                .await;
            if failed.is_ok() {
                if let Some(sandbox_id) = &session.sandbox_id {
                    self.stop_sandbox(sandbox_id).await;
                }
            }
            return;
        }

        let new_id = uuid::Uuid::new_v4().to_string();
        let replacement = {
            // A heartbeat may have landed between the tick and now.
            let guard = self.registry.lock(&old_id).await;
            let still_silent = self.liveness.snapshot(&old_id).map_or(true, |entry| {
                let ttl = if entry.activity.is_idle() {
                    self.config.idle_ttl
                } else {
                    self.config.running_ttl
                };
                missed_intervals(entry.last_seen.elapsed(), ttl) >= self.config.missed_threshold
            });
            if !still_silent {
                tracing::info!(session_id = %old_id, "Session recovered before restart");
                return;
            }
            match self.registry.find(&old_id).await {
                Ok(Some(current)) if current.state == SessionState::Running => {}
                Ok(_) => {
                    tracing::info!(session_id = %old_id, "Restart abandoned; session changed state");
                    return;
                }
                Err(err) => {
                    tracing::warn!(session_id = %old_id, error = %err, "Restart abandoned; session unreadable");
                    return;
                }
            }

            // The replacement row must exist before the old row points at it.
            let replacement = match self
                .registry
                .create(NewSession {
                    session_id: Some(new_id.clone()),
                    task_id: session.task_id.clone(),
                    labels: session.labels.clone(),
                    resources: session.resources.clone(),
                    recovery_state: session.recovery_state.carried_to_replacement(now),
                    restarted_from: Some(old_id.clone()),
                })
                .await
            {
                Ok(replacement) => Some(replacement),
                Err(err) => {
                    // Work already pushed stays referenced from the failed row.
                    tracing::error!(
                        session_id = %old_id,
                        task_id = %session.task_id,
                        error = %err,
                        "Could not record replacement session; failing without respawn"
                    );
                    None
                }
            };

            let (old_reason, replaced_by) = match &replacement {
                Some(_) => (reason.clone(), Some(new_id.clone())),
                None => (format!("{reason}; replacement could not be created"), None),
            };
            let result = self
                .registry
                .transition_locked(
                    &guard,
                    Transition::Unresponsive {
                        reason: old_reason,
                        replaced_by,
                    },
                )
                .await;
            if let Err(err) = result {
                tracing::info!(session_id = %old_id, error = %err, "Restart abandoned; session changed state");
                if replacement.is_some() {
                    self.discard_replacement(&new_id).await;
                }
                return;
            }
            replacement
        };
        tracing::warn!(
            session_id = %old_id,
            task_id = %session.task_id,
            replacement = ?replacement.as_ref().map(|r| r.session_id.as_str()),
            misses,
            "Session unresponsive; restarting"
        );

        let graceful_stop = match &session.sandbox_id {
            Some(sandbox_id) => self.stop_sandbox(sandbox_id).await,
            None => true,
        };
        let Some(replacement) = replacement else {
            return;
        };

        let new_sandbox_id = match self.provision(&replacement).await {
            Ok(sandbox_id) => sandbox_id,
            Err(err) => {
                tracing::error!(
                    session_id = %new_id,
                    restarted_from = %old_id,
                    error = %err,
                    "Replacement provisioning failed"
                );
                return;
            }
        };

        if let Err(err) = self
            .registry
            .bind_task(&session.task_id, &new_id, Some(&old_id))
            .await
        {
            tracing::error!(
                task_id = %session.task_id,
                session_id = %new_id,
                error = %err,
                "Task rebind failed after restart"
            );
        }

        let payload = json!({
            "old_session_id": old_id,
            "new_session_id": new_id,
            "old_sandbox_id": session.sandbox_id,
            "new_sandbox_id": new_sandbox_id,
            "graceful_stop": graceful_stop,
            "reason": reason,
            "restart_count": replacement.recovery_state.restart_count,
        });
        if let Err(err) = self
            .pipeline
            .emit_system(&new_id, EventType::SessionRestarted, payload)
            .await
        {
            tracing::warn!(session_id = %new_id, error = %err, "Failed to record restart event");
        }
        tracing::info!(
            old_session_id = %old_id,
            new_session_id = %new_id,
            task_id = %session.task_id,
            "Session restarted"
        );
    }

    /// Fail a replacement row that will never be provisioned.
    async fn discard_replacement(&self, session_id: &str) {
        let result = self
            .registry
            .transition(
                session_id,
                Transition::ProvisioningFailed {
                    reason: "restart abandoned".to_string(),
                },
            )
            .await;
        if let Err(err) = result {
            tracing::warn!(session_id, error = %err, "Failed to discard replacement session");
        }
    }

    /// Stop the sandbox behind a session that has just gone terminal, in the
    /// background.
    pub fn release_sandbox(self: &Arc<Self>, session: &SandboxSession) {
        let Some(sandbox_id) = session.sandbox_id.clone() else {
            return;
        };
        let this = Arc::clone(self);
        self.spawn_background(async move {
            this.stop_sandbox(&sandbox_id).await;
        });
    }

    /// Start provisioning a freshly created session in the background.
    pub fn start_provisioning(self: &Arc<Self>, session: SandboxSession) {
        let this = Arc::clone(self);
        self.spawn_background(async move {
            if let Err(err) = this.provision(&session).await {
                tracing::warn!(session_id = %session.session_id, error = %err, "Provisioning failed");
            }
        });
    }

    /// Request a sandbox for a PENDING session and move it to CREATING.
    ///
    /// On failure the session is failed with a Tier-1 error event.
    pub async fn provision(&self, session: &SandboxSession) -> Result<String, ControlError> {
        let session_id = session.session_id.clone();
        let token = match self.auth.mint(&session_id, &session.task_id) {
            Ok(minted) => minted.token,
            Err(err) => {
                self.fail_provisioning(&session_id, err.to_string()).await?;
                return Err(err);
            }
        };
        let spec = SandboxSpec {
            session_id: session_id.clone(),
            task_id: session.task_id.clone(),
            session_token: token,
            labels: session.labels.clone(),
            resources: session.resources.clone(),
        };

        let created = tokio::time::timeout(
            self.config.provision_timeout,
            self.provisioner.create(&spec),
        )
        .await;
        let sandbox_id = match created {
            Ok(Ok(sandbox_id)) => sandbox_id,
            Ok(Err(err)) => {
                let reason = format!("provisioning failed: {err}");
                self.fail_provisioning(&session_id, reason.clone()).await?;
                return Err(ControlError::UpstreamUnavailable(reason));
            }
            Err(_) => {
                let reason = format!(
                    "provisioning timed out after {}s",
                    self.config.provision_timeout.as_secs()
                );
                self.fail_provisioning(&session_id, reason.clone()).await?;
                return Err(ControlError::UpstreamUnavailable(reason));
            }
        };

        let result = self
            .registry
            .transition(
                &session_id,
                Transition::Provisioned {
                    sandbox_id: sandbox_id.clone(),
                },
            )
            .await;
        if let Err(err) = result {
            // Cancelled while provisioning, or the sandbox id is already in
            // use; either way nobody owns the new sandbox.
            tracing::warn!(
                session_id = %session_id,
                sandbox_id = %sandbox_id,
                error = %err,
                "Discarding sandbox for session that cannot accept it"
            );
            self.force_stop(&sandbox_id).await;
            if matches!(err, ControlError::Validation(_)) {
                self.fail_provisioning(&session_id, err.to_string()).await?;
            }
            return Err(err);
        }
        tracing::info!(session_id = %session_id, sandbox_id = %sandbox_id, "Sandbox provisioned");
        Ok(sandbox_id)
    }

    /// Report and fail a session whose provisioning went wrong. A session
    /// that already ended (cancelled meanwhile) is left alone.
    async fn fail_provisioning(&self, session_id: &str, reason: String) -> Result<(), ControlError> {
        let guard = self.registry.lock(session_id).await;
        let session = self.registry.get(session_id).await?;
        if session.is_terminal() {
            tracing::debug!(
                session_id,
                state = %session.state,
                reason = %reason,
                "Provisioning failure ignored; session already ended"
            );
            return Ok(());
        }
        self.report_error(session_id, json!({ "error": reason.clone(), "phase": "provisioning" }))
            .await;
        self.registry
            .transition_locked(&guard, Transition::ProvisioningFailed { reason })
            .await
            .map(|_| ())
    }

    /// Tier-1 error event for a session-fatal condition. Must run before the
    /// terminal transition, which closes the session's event lane.
    async fn report_error(&self, session_id: &str, payload: serde_json::Value) {
        if let Err(err) = self
            .pipeline
            .emit_system(session_id, EventType::AgentError, payload)
            .await
        {
            tracing::warn!(session_id, error = %err, "Failed to record session error event");
        }
    }

    /// Graceful stop with fallback to force. Returns whether the graceful
    /// stop succeeded.
    async fn stop_sandbox(&self, sandbox_id: &str) -> bool {
        let grace = self.config.graceful_stop_timeout;
        let graceful = tokio::time::timeout(grace, self.provisioner.terminate(sandbox_id, grace)).await;
        match graceful {
            Ok(Ok(())) => {
                tracing::debug!(sandbox_id, "Sandbox stopped gracefully");
                true
            }
            Ok(Err(err)) => {
                tracing::warn!(sandbox_id, error = %err, "Graceful stop failed; forcing");
                self.force_stop(sandbox_id).await;
                false
            }
            Err(_) => {
                tracing::warn!(sandbox_id, grace_secs = grace.as_secs(), "Graceful stop timed out; forcing");
                self.force_stop(sandbox_id).await;
                false
            }
        }
    }

    async fn force_stop(&self, sandbox_id: &str) {
        let result = tokio::time::timeout(
            self.config.provision_timeout,
            self.provisioner.force_terminate(sandbox_id),
        )
        .await;
        match result {
            Ok(Ok(())) => tracing::debug!(sandbox_id, "Sandbox force-terminated"),
            Ok(Err(err)) => {
                tracing::error!(sandbox_id, error = %err, "Force terminate failed; sandbox may leak")
            }
            Err(_) => tracing::error!(sandbox_id, "Force terminate timed out; sandbox may leak"),
        }
    }
}

fn missed_intervals(silent: Duration, ttl: Duration) -> u32 {
    if ttl.is_zero() {
        return u32::MAX;
    }
    (silent.as_millis() / ttl.as_millis().max(1)).min(u32::MAX as u128) as u32
}

#[async_trait]
impl SessionObserver for HeartbeatSupervisor {
    async fn on_transition(
        &self,
        session: &SandboxSession,
        _from: SessionState,
        transition: &Transition,
    ) {
        if session.is_terminal() {
            self.liveness.forget(&session.session_id);
        } else if matches!(transition, Transition::Provisioned { .. }) {
            self.liveness.register(&session.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::config::{AuthConfig, IngestConfig};
    use crate::events::{EventQuery, IncomingEvent};
    use crate::provisioner::ProvisionError;
    use crate::session::RecoveryState;
    use crate::events::{EventPage, SessionEvent};
    use crate::session::{CancelOutcome, RecoveryPatch, SessionUpdate};
    use crate::store::{ControlStore, InMemoryControlStore, RetentionReport, StoreError};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeProvisioner {
        created: AtomicU32,
        stopped: AtomicU32,
        forced: AtomicU32,
        fail_create: bool,
        hang_stop: bool,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn create(&self, spec: &SandboxSpec) -> Result<String, ProvisionError> {
            if self.fail_create {
                return Err(ProvisionError::Unavailable("no capacity".into()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sbx-{}-{n}", spec.task_id))
        }

        async fn terminate(&self, _sandbox_id: &str, _grace: Duration) -> Result<(), ProvisionError> {
            if self.hang_stop {
                std::future::pending::<()>().await;
            }
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn force_terminate(&self, _sandbox_id: &str) -> Result<(), ProvisionError> {
            self.forced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        pipeline: Arc<IngestPipeline>,
        provisioner: Arc<FakeProvisioner>,
        supervisor: Arc<HeartbeatSupervisor>,
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            tick_interval: Duration::from_secs(1),
            running_ttl: Duration::from_secs(10),
            idle_ttl: Duration::from_secs(20),
            missed_threshold: 3,
            creation_timeout: Duration::from_secs(30),
            idle_reap_after: Duration::from_secs(300),
            graceful_stop_timeout: Duration::from_secs(2),
            provision_timeout: Duration::from_secs(5),
            max_restarts: 2,
            restart_window: Duration::from_secs(3600),
        }
    }

    fn harness(provisioner: FakeProvisioner) -> Harness {
        harness_with_store(provisioner, Arc::new(InMemoryControlStore::new()))
    }

    fn harness_with_store(provisioner: FakeProvisioner, store: Arc<dyn ControlStore>) -> Harness {
        let registry = Arc::new(SessionRegistry::new(store, Duration::from_secs(1)));
        let liveness = Arc::new(LivenessTracker::new());
        let pipeline = Arc::new(IngestPipeline::new(
            IngestConfig::default(),
            Duration::from_secs(1),
            registry.clone(),
            Arc::new(BroadcastBus::default()),
            liveness.clone(),
            CancellationToken::new(),
        ));
        let provisioner = Arc::new(provisioner);
        let auth = Arc::new(Authenticator::new(&AuthConfig {
            session_token_secret: Some("secret".into()),
            ..AuthConfig::default()
        }));
        let supervisor = Arc::new(HeartbeatSupervisor::new(
            config(),
            registry.clone(),
            liveness,
            provisioner.clone(),
            pipeline.clone(),
            auth,
        ));
        registry.add_observer(pipeline.clone());
        registry.add_observer(supervisor.clone());
        Harness {
            registry,
            pipeline,
            provisioner,
            supervisor,
        }
    }

    async fn running_session(h: &Harness, recovery_state: RecoveryState) -> SandboxSession {
        let session = h
            .registry
            .create_for_task(NewSession {
                task_id: "t1".into(),
                recovery_state,
                ..Default::default()
            })
            .await
            .unwrap();
        h.supervisor.provision(&session).await.unwrap();
        h.pipeline
            .ingest(
                &session.session_id,
                IncomingEvent::new(EventType::Heartbeat, json!({"status": "running"})),
            )
            .await
            .unwrap();
        h.registry.get(&session.session_id).await.unwrap()
    }

    #[test]
    fn missed_intervals_floor_the_ratio() {
        assert_eq!(missed_intervals(Duration::from_secs(9), Duration::from_secs(10)), 0);
        assert_eq!(missed_intervals(Duration::from_secs(31), Duration::from_secs(10)), 3);
        assert_eq!(missed_intervals(Duration::from_secs(1), Duration::ZERO), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_is_restarted_exactly_once() {
        let h = harness(FakeProvisioner::default());
        let session = running_session(&h, RecoveryState::default()).await;
        assert_eq!(session.state, SessionState::Running);

        tokio::time::advance(Duration::from_secs(15)).await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;
        assert_eq!(h.provisioner.created.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        h.supervisor.tick().await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;

        assert_eq!(h.provisioner.created.load(Ordering::SeqCst), 2);
        assert_eq!(h.provisioner.stopped.load(Ordering::SeqCst), 1);

        let old = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(old.state, SessionState::Failed);
        let new_id = old.replaced_by.clone().unwrap();
        assert_eq!(
            h.registry.task_binding("t1").await.unwrap().as_deref(),
            Some(new_id.as_str())
        );

        let replacement = h.registry.get(&new_id).await.unwrap();
        assert_eq!(replacement.state, SessionState::Creating);
        assert_eq!(replacement.restarted_from.as_deref(), Some(session.session_id.as_str()));
        assert_eq!(replacement.recovery_state.restart_count, 1);

        let restarted = h
            .pipeline
            .history(
                &new_id,
                &EventQuery {
                    event_types: Some(vec![EventType::SessionRestarted]),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(restarted.events.len(), 1);
        assert_eq!(restarted.events[0].payload["old_session_id"], json!(session.session_id));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_graceful_stop_falls_back_to_force() {
        let h = harness(FakeProvisioner {
            hang_stop: true,
            ..Default::default()
        });
        let session = running_session(&h, RecoveryState::default()).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;

        assert_eq!(h.provisioner.forced.load(Ordering::SeqCst), 1);
        let old = h.registry.get(&session.session_id).await.unwrap();
        assert!(old.replaced_by.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_fails_without_respawn() {
        let h = harness(FakeProvisioner::default());
        let now = Utc::now();
        let history = RecoveryState {
            restart_count: 2,
            restart_history: vec![now, now],
            pushed: true,
            ..Default::default()
        };
        let session = running_session(&h, history).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;

        assert_eq!(h.provisioner.created.load(Ordering::SeqCst), 1);
        let failed = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert!(failed.replaced_by.is_none());
        assert!(failed.recovery_state.pushed);
        let errors = h
            .pipeline
            .history(
                &session.session_id,
                &EventQuery {
                    event_types: Some(vec![EventType::AgentError]),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(errors.events[0].payload["error"], json!("restart budget exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_reaped_not_restarted() {
        let h = harness(FakeProvisioner::default());
        let session = running_session(&h, RecoveryState::default()).await;
        for _ in 0..31 {
            tokio::time::advance(Duration::from_secs(10)).await;
            h.supervisor
                .liveness()
                .record_heartbeat(&session.session_id, WorkerActivity::Idle);
            h.supervisor.tick().await;
        }
        h.supervisor.settle().await;

        let reaped = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(reaped.state, SessionState::Failed);
        assert!(reaped.replaced_by.is_none());
        assert_eq!(h.provisioner.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.provisioner.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_timeout_fails_session() {
        let h = harness(FakeProvisioner::default());
        let session = h
            .registry
            .create_for_task(NewSession {
                task_id: "t1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        h.supervisor.provision(&session).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;
        let failed = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert_eq!(failed.terminal_reason.as_deref(), Some("creation timed out"));
    }

    #[tokio::test]
    async fn provisioning_failure_is_reported_and_fails_session() {
        let h = harness(FakeProvisioner {
            fail_create: true,
            ..Default::default()
        });
        let session = h
            .registry
            .create_for_task(NewSession {
                task_id: "t1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = h.supervisor.provision(&session).await.unwrap_err();
        assert!(matches!(err, ControlError::UpstreamUnavailable(_)));

        let failed = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        let events = h
            .pipeline
            .history(
                &session.session_id,
                &EventQuery {
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let types: Vec<_> = events.events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::AgentError, EventType::StateChanged]);
    }
    #[tokio::test(start_paused = true)]
    async fn busy_session_without_work_events_is_not_reaped() {
        let h = harness(FakeProvisioner::default());
        let session = running_session(&h, RecoveryState::default()).await;
        // One long tool call: heartbeats say running, no work events arrive.
        for _ in 0..31 {
            tokio::time::advance(Duration::from_secs(10)).await;
            h.supervisor
                .liveness()
                .record_heartbeat(&session.session_id, WorkerActivity::Running);
            h.supervisor.tick().await;
        }
        h.supervisor.settle().await;

        let busy = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(busy.state, SessionState::Running);
        assert_eq!(h.provisioner.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_provisioning_failure_leaves_ended_session_alone() {
        let h = harness(FakeProvisioner {
            fail_create: true,
            ..Default::default()
        });
        let session = h
            .registry
            .create_for_task(NewSession {
                task_id: "t1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        h.registry
            .transition(
                &session.session_id,
                Transition::Cancelled {
                    outcome: CancelOutcome::Failed,
                    reason: "operator stop".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.pipeline.open_lanes(), 0);

        assert!(h.supervisor.provision(&session).await.is_err());

        assert_eq!(h.pipeline.open_lanes(), 0);
        let events = h
            .pipeline
            .history(
                &session.session_id,
                &EventQuery {
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let types: Vec<_> = events.events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::StateChanged]);
        let ended = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(ended.terminal_reason.as_deref(), Some("operator stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_replacement_insert_is_not_referenced() {
        let store = Arc::new(FlakyStore::default());
        let h = harness_with_store(FakeProvisioner::default(), store.clone());
        let session = running_session(&h, RecoveryState::default()).await;

        store.fail_inserts.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(40)).await;
        h.supervisor.tick().await;
        h.supervisor.settle().await;

        let old = h.registry.get(&session.session_id).await.unwrap();
        assert_eq!(old.state, SessionState::Failed);
        assert!(old.replaced_by.is_none());
        assert!(old
            .terminal_reason
            .as_deref()
            .unwrap()
            .contains("replacement could not be created"));
        assert_eq!(h.provisioner.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.provisioner.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.registry.task_binding("t1").await.unwrap().as_deref(),
            Some(session.session_id.as_str())
        );
    }

    /// In-memory store whose session inserts can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryControlStore,
        fail_inserts: AtomicBool,
    }

    #[async_trait]
    impl ControlStore for FlakyStore {
        fn is_persistent(&self) -> bool {
            false
        }

        async fn insert_session(&self, session: &SandboxSession) -> Result<(), StoreError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Duplicate(session.session_id.clone()));
            }
            self.inner.insert_session(session).await
        }

        async fn get_session(&self, session_id: &str) -> Result<Option<SandboxSession>, StoreError> {
            self.inner.get_session(session_id).await
        }

        async fn list_sessions(
            &self,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<SandboxSession>, StoreError> {
            self.inner.list_sessions(limit, offset).await
        }

        async fn list_active_sessions(&self) -> Result<Vec<SandboxSession>, StoreError> {
            self.inner.list_active_sessions().await
        }

        async fn transition_session(
            &self,
            session_id: &str,
            allowed_from: &[SessionState],
            update: &SessionUpdate,
        ) -> Result<SandboxSession, StoreError> {
            self.inner
                .transition_session(session_id, allowed_from, update)
                .await
        }

        async fn update_recovery(
            &self,
            session_id: &str,
            patch: &RecoveryPatch,
        ) -> Result<SandboxSession, StoreError> {
            self.inner.update_recovery(session_id, patch).await
        }

        async fn bind_task(
            &self,
            task_id: &str,
            session_id: &str,
            expected: Option<&str>,
        ) -> Result<(), StoreError> {
            self.inner.bind_task(task_id, session_id, expected).await
        }

        async fn task_binding(&self, task_id: &str) -> Result<Option<String>, StoreError> {
            self.inner.task_binding(task_id).await
        }

        async fn append_event(
            &self,
            event: &SessionEvent,
            artifact: Option<&str>,
        ) -> Result<(), StoreError> {
            self.inner.append_event(event, artifact).await
        }

        async fn max_sequence(&self, session_id: &str) -> Result<u64, StoreError> {
            self.inner.max_sequence(session_id).await
        }

        async fn list_events(
            &self,
            session_id: &str,
            query: &EventQuery,
        ) -> Result<EventPage, StoreError> {
            self.inner.list_events(session_id, query).await
        }

        async fn get_event(&self, event_id: Uuid) -> Result<Option<SessionEvent>, StoreError> {
            self.inner.get_event(event_id).await
        }

        async fn get_artifact(&self, event_id: Uuid) -> Result<Option<String>, StoreError> {
            self.inner.get_artifact(event_id).await
        }

        async fn apply_retention(
            &self,
            artifacts_before: DateTime<Utc>,
            batched_before: DateTime<Utc>,
        ) -> Result<RetentionReport, StoreError> {
            self.inner
                .apply_retention(artifacts_before, batched_before)
                .await
        }
    }
}

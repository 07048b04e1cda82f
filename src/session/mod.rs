//! Sandbox session model and lifecycle state machine.
//!
//! ```text
//! PENDING -> CREATING -> RUNNING -> COMPLETING -> COMPLETED
//!    \           \          \            \
//!     +-----------+----------+------------+--> FAILED
//! ```
//!
//! Any non-terminal state may also be cancelled to `COMPLETED` or `FAILED`.
//! Sessions are never deleted; terminal rows stay for audit.

pub mod registry;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::{SessionGuard, SessionObserver, SessionRegistry};

/// Lifecycle state of a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Creating,
    Running,
    Completing,
    Completed,
    Failed,
}

impl SessionState {
    pub const NON_TERMINAL: [SessionState; 4] = [
        SessionState::Pending,
        SessionState::Creating,
        SessionState::Running,
        SessionState::Completing,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Completing => "COMPLETING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "CREATING" => Some(Self::Creating),
            "RUNNING" => Some(Self::Running),
            "COMPLETING" => Some(Self::Completing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome requested by an operator cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Completed,
    Failed,
}

/// A requested state change together with its cause.
///
/// Each variant names the only states it may start from; the registry
/// rejects anything else with a state conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The provisioner accepted the request and returned a sandbox id.
    Provisioned { sandbox_id: String },
    /// Provisioning was rejected or failed.
    ProvisioningFailed { reason: String },
    /// First heartbeat or first non-lifecycle event arrived.
    Activated,
    /// The session sat in CREATING longer than the creation timeout.
    CreationTimedOut,
    /// The owning task system marked the task done; finalization begins.
    TaskDone,
    /// The worker reported a fatal error.
    WorkerFatal { reason: String },
    /// The heartbeat supervisor declared the session unresponsive.
    Unresponsive {
        reason: String,
        replaced_by: Option<String>,
    },
    /// Heartbeats kept arriving but no work was reported for too long.
    IdleReaped,
    FinalizeSucceeded,
    FinalizeFailed { reason: String },
    /// Explicit operator cancellation.
    Cancelled {
        outcome: CancelOutcome,
        reason: String,
    },
}

impl Transition {
    pub fn allowed_from(&self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Self::Provisioned { .. } => &[Pending],
            Self::ProvisioningFailed { .. } => &[Pending, Creating],
            Self::Activated => &[Creating],
            Self::CreationTimedOut => &[Creating],
            Self::TaskDone => &[Running],
            Self::WorkerFatal { .. } | Self::Unresponsive { .. } | Self::IdleReaped => &[Running],
            Self::FinalizeSucceeded | Self::FinalizeFailed { .. } => &[Completing],
            Self::Cancelled { .. } => &SessionState::NON_TERMINAL,
        }
    }

    pub fn target(&self) -> SessionState {
        match self {
            Self::Provisioned { .. } => SessionState::Creating,
            Self::Activated => SessionState::Running,
            Self::TaskDone => SessionState::Completing,
            Self::FinalizeSucceeded => SessionState::Completed,
            Self::Cancelled { outcome, .. } => match outcome {
                CancelOutcome::Completed => SessionState::Completed,
                CancelOutcome::Failed => SessionState::Failed,
            },
            Self::ProvisioningFailed { .. }
            | Self::CreationTimedOut
            | Self::WorkerFatal { .. }
            | Self::Unresponsive { .. }
            | Self::IdleReaped
            | Self::FinalizeFailed { .. } => SessionState::Failed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Provisioned { .. } => "provisioned",
            Self::ProvisioningFailed { .. } => "provisioning_failed",
            Self::Activated => "activated",
            Self::CreationTimedOut => "creation_timed_out",
            Self::TaskDone => "task_done",
            Self::WorkerFatal { .. } => "worker_fatal",
            Self::Unresponsive { .. } => "unresponsive",
            Self::IdleReaped => "idle_reaped",
            Self::FinalizeSucceeded => "finalize_succeeded",
            Self::FinalizeFailed { .. } => "finalize_failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Column updates the store applies together with the state change.
    pub fn to_update(&self) -> SessionUpdate {
        let mut update = SessionUpdate {
            target: self.target(),
            sandbox_id: None,
            terminal_reason: None,
            replaced_by: None,
        };
        match self {
            Self::Provisioned { sandbox_id } => update.sandbox_id = Some(sandbox_id.clone()),
            Self::ProvisioningFailed { reason }
            | Self::WorkerFatal { reason }
            | Self::FinalizeFailed { reason }
            | Self::Cancelled { reason, .. } => update.terminal_reason = Some(reason.clone()),
            Self::Unresponsive {
                reason,
                replaced_by,
            } => {
                update.terminal_reason = Some(reason.clone());
                update.replaced_by = replaced_by.clone();
            }
            Self::CreationTimedOut => {
                update.terminal_reason = Some("creation timed out".to_string())
            }
            Self::IdleReaped => {
                update.terminal_reason = Some("idle timeout: no work progress".to_string())
            }
            Self::FinalizeSucceeded => update.terminal_reason = Some("finalized".to_string()),
            Self::Activated | Self::TaskDone => {}
        }
        update
    }
}

/// Columns written atomically with a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub target: SessionState,
    pub sandbox_id: Option<String>,
    pub terminal_reason: Option<String>,
    pub replaced_by: Option<String>,
}

/// Partial-failure progress for finalization and restarts.
///
/// Flags only ever move from `false` to `true`; artifacts recorded here are
/// never cleared so a failed session can be recovered by hand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub branch_created: bool,
    #[serde(default)]
    pub pushed: bool,
    #[serde(default)]
    pub pr_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub restart_count: u32,
    /// Timestamps of restarts for the owning task, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart_history: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Incremental update to a [`RecoveryState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPatch {
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub branch_created: Option<bool>,
    #[serde(default)]
    pub pushed: Option<bool>,
    #[serde(default)]
    pub pr_created: Option<bool>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub increment_retry: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RecoveryState {
    pub fn apply(&mut self, patch: &RecoveryPatch) {
        if let Some(branch) = &patch.branch_name {
            self.branch_name = Some(branch.clone());
        }
        // Monotonic: a completed external side effect is never forgotten.
        self.branch_created |= patch.branch_created.unwrap_or(false);
        self.pushed |= patch.pushed.unwrap_or(false);
        self.pr_created |= patch.pr_created.unwrap_or(false);
        if let Some(url) = &patch.pr_url {
            self.pr_url = Some(url.clone());
        }
        if patch.increment_retry {
            self.retry_count = self.retry_count.saturating_add(1);
        }
        if let Some(err) = &patch.last_error {
            self.last_error = Some(err.clone());
        }
    }

    /// Restarts recorded since `cutoff`.
    pub fn restarts_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.restart_history.iter().filter(|t| **t >= cutoff).count()
    }

    /// Recovery state carried over to a replacement session.
    pub fn carried_to_replacement(&self, restarted_at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.restart_count = next.restart_count.saturating_add(1);
        next.restart_history.push(restarted_at);
        next
    }
}

/// One sandbox worker execution instance bound to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSession {
    pub session_id: String,
    pub task_id: String,
    /// External sandbox identifier, known once provisioning is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub state: SessionState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: serde_json::Value,
    #[serde(default)]
    pub recovery_state: RecoveryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    /// Session this one was restarted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_from: Option<String>,
    /// Replacement session started after this one was declared unresponsive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Parameters for creating a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Pre-assigned id (restarts reserve the replacement id up front).
    pub session_id: Option<String>,
    pub task_id: String,
    pub labels: BTreeMap<String, String>,
    pub resources: serde_json::Value,
    pub recovery_state: RecoveryState,
    pub restarted_from: Option<String>,
}

impl SandboxSession {
    pub fn new(spec: NewSession) -> Self {
        let now = Utc::now();
        Self {
            session_id: spec
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            task_id: spec.task_id,
            sandbox_id: None,
            state: SessionState::Pending,
            labels: spec.labels,
            resources: spec.resources,
            recovery_state: spec.recovery_state,
            terminal_reason: None,
            restarted_from: spec.restarted_from,
            replaced_by: None,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 6] = [
        SessionState::Pending,
        SessionState::Creating,
        SessionState::Running,
        SessionState::Completing,
        SessionState::Completed,
        SessionState::Failed,
    ];

    fn every_transition() -> Vec<Transition> {
        vec![
            Transition::Provisioned {
                sandbox_id: "sbx".into(),
            },
            Transition::ProvisioningFailed { reason: "x".into() },
            Transition::Activated,
            Transition::CreationTimedOut,
            Transition::TaskDone,
            Transition::WorkerFatal { reason: "x".into() },
            Transition::Unresponsive {
                reason: "x".into(),
                replaced_by: None,
            },
            Transition::IdleReaped,
            Transition::FinalizeSucceeded,
            Transition::FinalizeFailed { reason: "x".into() },
            Transition::Cancelled {
                outcome: CancelOutcome::Completed,
                reason: "x".into(),
            },
            Transition::Cancelled {
                outcome: CancelOutcome::Failed,
                reason: "x".into(),
            },
        ]
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        for transition in every_transition() {
            for from in transition.allowed_from() {
                assert!(!from.is_terminal(), "{} starts from terminal", transition.name());
            }
        }
    }

    #[test]
    fn transitions_only_follow_the_lifecycle_graph() {
        use SessionState::*;
        let graph: &[(SessionState, SessionState)] = &[
            (Pending, Creating),
            (Pending, Completed),
            (Pending, Failed),
            (Creating, Running),
            (Creating, Completed),
            (Creating, Failed),
            (Running, Completing),
            (Running, Completed),
            (Running, Failed),
            (Completing, Completed),
            (Completing, Failed),
        ];
        for transition in every_transition() {
            for from in ALL {
                if transition.allowed_from().contains(&from) {
                    assert!(
                        graph.contains(&(from, transition.target())),
                        "{} allows {} -> {}",
                        transition.name(),
                        from,
                        transition.target()
                    );
                }
            }
        }
    }

    #[test]
    fn recovery_flags_are_monotonic() {
        let mut state = RecoveryState::default();
        state.apply(&RecoveryPatch {
            branch_name: Some("feature/x".into()),
            branch_created: Some(true),
            pushed: Some(true),
            ..Default::default()
        });
        state.apply(&RecoveryPatch {
            branch_created: Some(false),
            pushed: Some(false),
            increment_retry: true,
            last_error: Some("push rejected".into()),
            ..Default::default()
        });
        assert!(state.branch_created);
        assert!(state.pushed);
        assert_eq!(state.branch_name.as_deref(), Some("feature/x"));
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("push rejected"));
    }

    #[test]
    fn replacement_inherits_progress_and_counts_restart() {
        let mut state = RecoveryState {
            pr_created: true,
            pr_url: Some("https://example.test/pr/1".into()),
            ..Default::default()
        };
        let now = Utc::now();
        state.restart_history.push(now - chrono::Duration::hours(2));
        let next = state.carried_to_replacement(now);
        assert!(next.pr_created);
        assert_eq!(next.restart_count, 1);
        assert_eq!(next.restarts_since(now - chrono::Duration::hours(1)), 1);
        assert_eq!(next.restart_history.len(), 2);
    }

    #[test]
    fn state_round_trips_through_its_wire_name() {
        for state in ALL {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(
            serde_json::to_value(SessionState::Completing).unwrap(),
            serde_json::json!("COMPLETING")
        );
    }
}

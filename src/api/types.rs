//! Request and response bodies for the HTTP surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::events::{EventType, Tier};
use crate::guard::MintedSessionToken;
use crate::queue::{InjectMode, MessageType, Priority, SessionCommand};
use crate::session::{CancelOutcome, RecoveryPatch, SandboxSession, SessionState};

// ─────────────────────────────────────────────────────────────────────────────
// Worker-facing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    /// Wire name, e.g. `agent.tool_use`. Checked against the closed set.
    pub event_type: String,
    #[serde(default = "empty_object")]
    pub event_data: Value,
    #[serde(default)]
    pub source: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Serialize)]
pub struct IngestEventResponse {
    pub event_id: Uuid,
    pub sequence: u64,
    pub event_type: EventType,
    pub tier: Tier,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventHistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Comma-separated wire names.
    pub event_type: Option<String>,
    pub after_sequence: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub session_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metrics: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub session_id: String,
    pub state: SessionState,
    pub sequence: u64,
    /// Pause/resume/abort commands queued since the last heartbeat.
    pub commands: Vec<SessionCommand>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages & interventions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostInterventionRequest {
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub inject_mode: InjectMode,
}

#[derive(Debug, Serialize)]
pub struct MessageAccepted {
    pub status: &'static str,
    pub message_id: String,
    pub session_id: String,
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub event_id: Uuid,
    pub session_id: String,
    pub content: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub task_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Value,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session: SandboxSession,
    pub token: MintedSessionToken,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSessionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SandboxSession>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Progress recorded before the outcome is applied.
    #[serde(default)]
    pub recovery: Option<RecoveryPatch>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub outcome: CancelOutcome,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskInterventionRequest {
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub inject_mode: InjectMode,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store_persistent: bool,
    pub open_lanes: usize,
    pub tracked_sessions: usize,
}

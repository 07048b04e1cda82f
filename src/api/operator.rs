//! Operator endpoints: session lifecycle control and task-level intervention
//! routing. Every handler requires the operator token.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};

use super::routes::AppState;
use super::types::*;
use crate::error::ControlError;
use crate::guard::{Principal, ValidJson};
use crate::intervention::{Intervention, RouteOutcome};
use crate::queue::{NewMessage, Priority, SessionCommand};
use crate::session::{NewSession, RecoveryPatch, SandboxSession, Transition};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    ValidJson(req): ValidJson<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ControlError> {
    principal.require_operator()?;

    let session = state
        .registry
        .create_for_task(NewSession {
            task_id: req.task_id,
            labels: req.labels,
            resources: req.resources,
            ..Default::default()
        })
        .await?;
    let token = state.auth.mint(&session.session_id, &session.task_id)?;
    state.supervisor.start_provisioning(session.clone());

    Ok(Json(CreateSessionResponse { session, token }))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<ListSessionsQuery>,
) -> Result<Json<ListSessionsResponse>, ControlError> {
    principal.require_operator()?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = params.offset.unwrap_or(0);
    let sessions = state.registry.list(limit, offset).await?;
    Ok(Json(ListSessionsResponse {
        sessions,
        limit,
        offset,
    }))
}

/// Readable by the operator and by the session itself.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Json<SandboxSession>, ControlError> {
    principal.authorize_session(&session_id)?;
    Ok(Json(state.registry.get(&session_id).await?))
}

pub async fn complete_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Json<SandboxSession>, ControlError> {
    principal.require_operator()?;
    let session = state
        .registry
        .transition(&session_id, Transition::TaskDone)
        .await?;
    Ok(Json(session))
}

/// Apply the finalization outcome. Recovery progress in the request is
/// recorded first so a failed finalization keeps it.
pub async fn finalize_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(req): ValidJson<FinalizeRequest>,
) -> Result<Json<SandboxSession>, ControlError> {
    principal.require_operator()?;

    if let Some(patch) = &req.recovery {
        state.registry.update_recovery(&session_id, patch).await?;
    }
    let transition = if req.success {
        Transition::FinalizeSucceeded
    } else {
        Transition::FinalizeFailed {
            reason: req
                .error
                .unwrap_or_else(|| "finalization failed".to_string()),
        }
    };
    let session = state.registry.transition(&session_id, transition).await?;
    state.supervisor.release_sandbox(&session);
    Ok(Json(session))
}

pub async fn update_recovery(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(patch): ValidJson<RecoveryPatch>,
) -> Result<Json<SandboxSession>, ControlError> {
    principal.require_operator()?;
    Ok(Json(
        state.registry.update_recovery(&session_id, &patch).await?,
    ))
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(req): ValidJson<CancelRequest>,
) -> Result<Json<SandboxSession>, ControlError> {
    principal.require_operator()?;
    let session = state
        .registry
        .transition(
            &session_id,
            Transition::Cancelled {
                outcome: req.outcome,
                reason: req
                    .reason
                    .unwrap_or_else(|| "cancelled by operator".to_string()),
            },
        )
        .await?;
    state.supervisor.release_sandbox(&session);
    tracing::info!(session_id = %session_id, outcome = ?req.outcome, "Session cancelled");
    Ok(Json(session))
}

pub async fn send_command(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(command): ValidJson<SessionCommand>,
) -> Result<Json<MessageAccepted>, ControlError> {
    principal.require_operator()?;
    let queued = state
        .queue
        .enqueue(&session_id, NewMessage::command(command))
        .await?;
    Ok(Json(MessageAccepted {
        status: "queued",
        message_id: queued.message_id,
        session_id: queued.session_id,
        priority: queued.priority,
    }))
}

/// Route an intervention for a task to its sandbox session, or directly
/// when the task never ran in a sandbox.
pub async fn route_intervention(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(task_id): Path<String>,
    ValidJson(req): ValidJson<TaskInterventionRequest>,
) -> Result<Json<RouteOutcome>, ControlError> {
    principal.require_operator()?;
    let outcome = state
        .router
        .route(
            &task_id,
            Intervention {
                message: req.message,
                source: req.source,
                priority: req.priority.unwrap_or(Priority::Urgent),
                inject_mode: req.inject_mode,
            },
        )
        .await?;
    Ok(Json(outcome))
}

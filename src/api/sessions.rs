//! Worker-facing session endpoints: event ingestion and history, message and
//! intervention queues, heartbeats and artifacts.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde_json::json;
use uuid::Uuid;

use super::routes::AppState;
use super::types::*;
use crate::error::ControlError;
use crate::events::{EventPage, EventQuery, EventSource, EventType, IncomingEvent};
use crate::guard::{EndpointClass, Principal, ValidJson};
use crate::queue::{MessageType, NewMessage, QueuedMessage};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Authorize the caller for `session_id` and charge one request against its
/// rate-limit window.
fn admit(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
    class: EndpointClass,
) -> Result<(), ControlError> {
    principal.authorize_session(session_id)?;
    state.limiter.check(session_id, class)
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

pub async fn post_event(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(req): ValidJson<IngestEventRequest>,
) -> Result<Json<IngestEventResponse>, ControlError> {
    admit(&state, &principal, &session_id, EndpointClass::Events)?;

    let event_type = EventType::parse(&req.event_type).ok_or_else(|| {
        ControlError::validation(format!("unknown event_type: {}", req.event_type))
    })?;
    let source = match req.source.as_deref() {
        None => EventSource::Agent,
        Some(raw) => EventSource::parse(raw)
            .ok_or_else(|| ControlError::validation(format!("unknown source: {raw}")))?,
    };

    let event = state
        .pipeline
        .ingest(
            &session_id,
            IncomingEvent {
                event_type,
                payload: req.event_data,
                source,
            },
        )
        .await?;

    Ok(Json(IngestEventResponse {
        event_id: event.event_id,
        sequence: event.sequence,
        event_type: event.event_type,
        tier: event.tier,
    }))
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    Query(params): Query<EventHistoryQuery>,
) -> Result<Json<EventPage>, ControlError> {
    principal.authorize_session(&session_id)?;

    let event_types = match params.event_type.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    EventType::parse(name).ok_or_else(|| {
                        ControlError::validation(format!("unknown event_type: {name}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };
    let query = EventQuery {
        event_types,
        after_sequence: params.after_sequence,
        limit: params
            .limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT),
        offset: params.offset.unwrap_or(0),
    };

    let page = state.pipeline.history(&session_id, &query).await?;
    Ok(Json(page))
}

pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<ArtifactResponse>, ControlError> {
    let event = state.pipeline.event(event_id).await?;
    principal.authorize_session(&event.session_id)?;
    let content = state.pipeline.artifact(event_id).await?;
    Ok(Json(ArtifactResponse {
        event_id,
        session_id: event.session_id,
        content,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages & interventions
// ─────────────────────────────────────────────────────────────────────────────

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(req): ValidJson<PostMessageRequest>,
) -> Result<Json<MessageAccepted>, ControlError> {
    principal.require_operator()?;
    let queued = state
        .queue
        .enqueue(
            &session_id,
            NewMessage {
                content: req.content,
                message_type: req.message_type,
                priority: req.priority,
                source: req.source,
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(accepted(queued)))
}

/// Destructive poll: returns every pending message, urgent first.
pub async fn poll_messages(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<QueuedMessage>>, ControlError> {
    admit(&state, &principal, &session_id, EndpointClass::Polls)?;
    let messages = state.queue.fetch(&session_id).await?;
    if !messages.is_empty() {
        tracing::debug!(
            session_id = %session_id,
            delivered = messages.len(),
            "Messages delivered"
        );
    }
    Ok(Json(messages))
}

pub async fn post_intervention(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
    ValidJson(req): ValidJson<PostInterventionRequest>,
) -> Result<Json<MessageAccepted>, ControlError> {
    principal.require_operator()?;
    let queued = state
        .queue
        .enqueue(
            &session_id,
            NewMessage {
                content: req.message,
                message_type: MessageType::GuardianIntervention,
                priority: req.priority,
                source: req.source,
                inject_mode: req.inject_mode,
                command: None,
            },
        )
        .await?;
    Ok(Json(accepted(queued)))
}

/// Hook-mode poll. Shares the session queue with [`poll_messages`].
pub async fn poll_interventions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<QueuedMessage>>, ControlError> {
    admit(&state, &principal, &session_id, EndpointClass::Polls)?;
    Ok(Json(state.queue.fetch(&session_id).await?))
}

fn accepted(message: QueuedMessage) -> MessageAccepted {
    MessageAccepted {
        status: "queued",
        message_id: message.message_id,
        session_id: message.session_id,
        priority: message.priority,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat
// ─────────────────────────────────────────────────────────────────────────────

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    ValidJson(req): ValidJson<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ControlError> {
    admit(&state, &principal, &req.session_id, EndpointClass::Heartbeats)?;

    let mut payload = json!({});
    if let Some(status) = &req.status {
        payload["status"] = json!(status);
    }
    if let Some(metrics) = req.metrics {
        payload["metrics"] = metrics;
    }

    let event = state
        .pipeline
        .ingest(
            &req.session_id,
            IncomingEvent::new(EventType::Heartbeat, payload),
        )
        .await?;
    let commands = state.queue.take_commands(&req.session_id).await?;
    let session = state.registry.get(&req.session_id).await?;

    Ok(Json(HeartbeatResponse {
        session_id: req.session_id,
        state: session.state,
        sequence: event.sequence,
        commands,
    }))
}

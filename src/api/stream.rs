//! Server-Sent Events views of the pub/sub bus.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Extension,
};
use futures::Stream;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::routes::AppState;
use crate::bus::{session_channel, BusMessage, MONITOR_CHANNEL};
use crate::error::ControlError;
use crate::guard::Principal;

const KEEPALIVE: Duration = Duration::from_secs(15);

/// Live events for one session. Closes when the session ends.
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ControlError> {
    principal.authorize_session(&session_id)?;
    let session = state.registry.get(&session_id).await?;
    if session.is_terminal() {
        return Err(ControlError::StateConflict {
            session_id,
            expected: "a non-terminal session".to_string(),
            actual: session.state,
        });
    }

    let rx = state.bus.subscribe(&session_channel(&session_id));
    Ok(sse(rx, session_channel(&session_id)))
}

/// Every session's events, for dashboards.
pub async fn monitor_stream(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ControlError> {
    principal.require_operator()?;
    let rx = state.bus.subscribe(MONITOR_CHANNEL);
    Ok(sse(rx, MONITOR_CHANNEL.to_string()))
}

fn sse(
    mut rx: broadcast::Receiver<BusMessage>,
    channel: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream_id = Uuid::new_v4();
    tracing::info!(stream_id = %stream_id, channel = %channel, "SSE stream opened");

    struct StreamDropGuard {
        stream_id: Uuid,
        channel: String,
    }

    impl Drop for StreamDropGuard {
        fn drop(&mut self) {
            tracing::info!(
                stream_id = %self.stream_id,
                channel = %self.channel,
                "SSE stream closed"
            );
        }
    }

    let drop_guard = StreamDropGuard { stream_id, channel };

    let stream = async_stream::stream! {
        let _guard = drop_guard;

        let mut keepalive_interval = tokio::time::interval(KEEPALIVE);
        keepalive_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(message) => {
                            tracing::trace!(
                                stream_id = %stream_id,
                                event = message.event_name(),
                                session_id = %message.session_id(),
                                "SSE event"
                            );
                            match Event::default().event(message.event_name()).json_data(&message) {
                                Ok(sse) => yield Ok(sse),
                                Err(e) => {
                                    tracing::error!(
                                        stream_id = %stream_id,
                                        error = %e,
                                        "Failed to serialize SSE event; dropping"
                                    );
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                stream_id = %stream_id,
                                skipped,
                                "SSE stream lagged; events dropped"
                            );
                            let payload = json!({
                                "message": "event stream lagged; fetch history to resync",
                                "skipped": skipped,
                            });
                            if let Ok(sse) = Event::default().event("error").json_data(payload) {
                                yield Ok(sse);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = keepalive_interval.tick() => {
                    yield Ok(Event::default().comment("keepalive"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE).text("keepalive"))
}

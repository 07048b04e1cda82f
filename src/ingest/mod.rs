//! Event ingestion pipeline.
//!
//! Accepted events are validated, sequenced under a per-session lock,
//! persisted (with bounded retry) and only then broadcast: Tier 1 right
//! away, Tier 2 through the session's batcher. Persistence is the source of
//! truth; a broadcast failure after a successful write is logged, never
//! surfaced to the producer.

mod batcher;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use batcher::Tier2Batcher;

use crate::bus::{session_channel, BusMessage, EventBus, MONITOR_CHANNEL};
use crate::config::IngestConfig;
use crate::error::ControlError;
use crate::events::{
    EventCategory, EventPage, EventQuery, EventSource, EventType, IncomingEvent, SessionEvent,
    Tier,
};
use crate::retry::{retry_with_backoff, BackoffConfig, RetryError};
use crate::session::{
    SandboxSession, SessionObserver, SessionRegistry, SessionState, Transition,
};
use crate::store::StoreError;
use crate::supervisor::{LivenessTracker, WorkerActivity};

/// Per-session ingestion state.
#[derive(Default)]
struct Lane {
    /// Next sequence to assign; `None` until loaded from the store.
    next_sequence: Mutex<Option<u64>>,
    batcher: Mutex<Option<Tier2Batcher>>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    backoff: BackoffConfig,
    registry: Arc<SessionRegistry>,
    bus: Arc<dyn EventBus>,
    liveness: Arc<LivenessTracker>,
    lanes: DashMap<String, Arc<Lane>>,
    shutdown: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        store_timeout: std::time::Duration,
        registry: Arc<SessionRegistry>,
        bus: Arc<dyn EventBus>,
        liveness: Arc<LivenessTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        let backoff = BackoffConfig::from_ingest(&config, store_timeout);
        Self {
            config,
            backoff,
            registry,
            bus,
            liveness,
            lanes: DashMap::new(),
            shutdown,
        }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    fn lane(&self, session_id: &str) -> Arc<Lane> {
        self.lanes
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Accept an event from a worker.
    ///
    /// Control-plane event types and the `system` source are refused here;
    /// those records only come from [`IngestPipeline::emit_system`].
    pub async fn ingest(
        &self,
        session_id: &str,
        incoming: IncomingEvent,
    ) -> Result<SessionEvent, ControlError> {
        if incoming.event_type.is_control_plane_only() {
            return Err(ControlError::validation(format!(
                "{} is recorded by the control plane only",
                incoming.event_type
            )));
        }
        if incoming.source == EventSource::System {
            return Err(ControlError::validation(
                "source \"system\" is reserved for the control plane",
            ));
        }
        self.validate_payload(&incoming.payload)?;

        let guard = self.registry.lock(session_id).await;
        let session = self.registry.get(session_id).await?;
        if session.is_terminal() {
            return Err(ControlError::StateConflict {
                session_id: session_id.to_string(),
                expected: "a non-terminal session".to_string(),
                actual: session.state,
            });
        }

        let event_type = incoming.event_type;
        let failure_reason = (event_type == EventType::AgentFailed).then(|| {
            incoming
                .payload
                .get("error")
                .or_else(|| incoming.payload.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("worker reported a fatal error")
                .to_string()
        });

        let event = self.append(session_id, incoming).await?;
        if event_type == EventType::Heartbeat {
            let activity = event
                .payload
                .get("status")
                .and_then(Value::as_str)
                .map(WorkerActivity::parse)
                .unwrap_or_default();
            self.liveness.record_heartbeat(session_id, activity);
        } else {
            self.liveness.record_event(session_id, event_type);
        }

        let mut state = session.state;
        if state == SessionState::Creating && event_type.category() != EventCategory::Lifecycle {
            state = self
                .apply_side_effect(&guard, Transition::Activated)
                .await
                .unwrap_or(state);
        }
        if let (SessionState::Running, Some(reason)) = (state, failure_reason) {
            self.apply_side_effect(&guard, Transition::WorkerFatal { reason })
                .await;
        }
        Ok(event)
    }

    /// Transitions triggered by an event. Losing a race to a concurrent
    /// transition is expected and not an ingestion failure.
    async fn apply_side_effect(
        &self,
        guard: &crate::session::SessionGuard,
        transition: Transition,
    ) -> Option<SessionState> {
        match self.registry.transition_locked(guard, transition).await {
            Ok(session) => Some(session.state),
            Err(err) => {
                tracing::debug!(
                    session_id = guard.session_id(),
                    error = %err,
                    "Event-driven transition skipped"
                );
                None
            }
        }
    }

    /// Record an event produced by the control plane itself.
    ///
    /// Skips the terminal-state check so the final state change of a
    /// session is still recorded. Callers must not use it for sessions
    /// whose lane has already been torn down.
    pub async fn emit_system(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: Value,
    ) -> Result<SessionEvent, ControlError> {
        self.append(session_id, IncomingEvent::system(event_type, payload))
            .await
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), ControlError> {
        if !payload.is_object() {
            return Err(ControlError::validation("event_data must be a JSON object"));
        }
        let size = serde_json::to_vec(payload)
            .map_err(|e| ControlError::validation(format!("unserializable event_data: {e}")))?
            .len();
        if size > self.config.max_payload_bytes {
            return Err(ControlError::validation(format!(
                "event_data is {size} bytes, limit is {}",
                self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Sequence, persist and dispatch one event.
    async fn append(
        &self,
        session_id: &str,
        incoming: IncomingEvent,
    ) -> Result<SessionEvent, ControlError> {
        let lane = self.lane(session_id);
        let mut next = lane.next_sequence.lock().await;
        let sequence = match *next {
            Some(sequence) => sequence,
            None => self.load_max_sequence(session_id).await? + 1,
        };

        let (payload, artifact) =
            split_artifact(incoming.event_type, incoming.payload, self.config.preview_bytes);
        let event = SessionEvent {
            event_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            sequence,
            event_type: incoming.event_type,
            category: incoming.event_type.category(),
            tier: incoming.event_type.tier(),
            source: incoming.source,
            payload,
            created_at: Utc::now(),
        };

        self.persist(&event, artifact.as_deref()).await?;
        *next = Some(sequence + 1);

        match event.tier {
            Tier::Immediate => self.publish_immediate(&event).await,
            Tier::Batched => self.push_batched(session_id, &lane, event.clone()).await,
        }
        drop(next);

        tracing::debug!(
            session_id,
            sequence,
            event_type = %event.event_type,
            "Event accepted"
        );
        Ok(event)
    }

    async fn load_max_sequence(&self, session_id: &str) -> Result<u64, ControlError> {
        let store = self.registry.store();
        retry_with_backoff(
            "max_sequence",
            &self.backoff,
            StoreError::is_transient,
            move || store.max_sequence(session_id),
        )
        .await
        .map_err(|err| retry_to_control("max_sequence", err))
    }

    async fn persist(&self, event: &SessionEvent, artifact: Option<&str>) -> Result<(), ControlError> {
        let store = self.registry.store();
        retry_with_backoff(
            "append_event",
            &self.backoff,
            StoreError::is_transient,
            move || store.append_event(event, artifact),
        )
        .await
        .map_err(|err| {
            tracing::error!(
                session_id = %event.session_id,
                sequence = event.sequence,
                event_type = %event.event_type,
                error = %err,
                "Dropping event after store failure"
            );
            retry_to_control("append_event", err)
        })
    }

    async fn publish_immediate(&self, event: &SessionEvent) {
        let message = BusMessage::Event {
            event: event.clone(),
        };
        for channel in [session_channel(&event.session_id), MONITOR_CHANNEL.to_string()] {
            let target = channel.as_str();
            let message = &message;
            let bus = self.bus.as_ref();
            let result = retry_with_backoff("publish", &self.backoff, |_| true, move || {
                bus.publish(target, message.clone())
            })
            .await;
            if let Err(err) = result {
                tracing::error!(
                    session_id = %event.session_id,
                    sequence = event.sequence,
                    channel = %channel,
                    error = %err,
                    "Event persisted but broadcast failed"
                );
            }
        }
    }

    async fn push_batched(&self, session_id: &str, lane: &Lane, event: SessionEvent) {
        let mut slot = lane.batcher.lock().await;
        let batcher = slot.get_or_insert_with(|| {
            Tier2Batcher::spawn(
                session_id.to_string(),
                Arc::clone(&self.bus),
                self.config.tier2_flush_interval,
                self.config.tier2_batch_cap,
                self.backoff.clone(),
                &self.shutdown,
            )
        });
        batcher.push(event).await;
    }

    /// Flush and release everything held for a session.
    pub async fn close_session(&self, session_id: &str) {
        let Some((_, lane)) = self.lanes.remove(session_id) else {
            return;
        };
        // Wait for any in-flight append on this lane to finish dispatching.
        let _sequence = lane.next_sequence.lock().await;
        if let Some(batcher) = lane.batcher.lock().await.take() {
            batcher.close().await;
        }
        self.bus.close(&session_channel(session_id));
        tracing::debug!(session_id, "Ingestion lane closed");
    }

    /// Flush every open batcher (graceful shutdown).
    pub async fn flush_all(&self) {
        let ids: Vec<String> = self.lanes.iter().map(|e| e.key().clone()).collect();
        for session_id in ids {
            if let Some(lane) = self.lanes.get(&session_id).map(|l| Arc::clone(l.value())) {
                if let Some(batcher) = lane.batcher.lock().await.take() {
                    batcher.close().await;
                }
            }
        }
    }

    pub fn open_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Paginated event history, oldest first.
    pub async fn history(
        &self,
        session_id: &str,
        query: &EventQuery,
    ) -> Result<EventPage, ControlError> {
        self.registry.get(session_id).await?;
        let store = self.registry.store();
        retry_with_backoff(
            "list_events",
            &self.backoff,
            StoreError::is_transient,
            move || store.list_events(session_id, query),
        )
        .await
        .map_err(|err| retry_to_control("list_events", err))
    }

    pub async fn event(&self, event_id: Uuid) -> Result<SessionEvent, ControlError> {
        let store = self.registry.store();
        retry_with_backoff(
            "get_event",
            &self.backoff,
            StoreError::is_transient,
            move || store.get_event(event_id),
        )
        .await
        .map_err(|err| retry_to_control("get_event", err))?
        .ok_or_else(|| ControlError::not_found(format!("event {event_id}")))
    }

    /// Full content of a truncated diff.
    pub async fn artifact(&self, event_id: Uuid) -> Result<String, ControlError> {
        let store = self.registry.store();
        retry_with_backoff(
            "get_artifact",
            &self.backoff,
            StoreError::is_transient,
            move || store.get_artifact(event_id),
        )
        .await
        .map_err(|err| retry_to_control("get_artifact", err))?
        .ok_or_else(|| ControlError::not_found(format!("artifact for event {event_id}")))
    }
}

fn retry_to_control(op: &str, err: RetryError<StoreError>) -> ControlError {
    match err {
        RetryError::Failed { last, .. } if !last.is_transient() => ControlError::from(last),
        other => ControlError::UpstreamUnavailable(format!("{op}: {other}")),
    }
}

/// Move an oversized diff out of a file-edit payload.
///
/// Returns the payload to broadcast and, when truncated, the full diff to
/// store as an artifact.
fn split_artifact(
    event_type: EventType,
    mut payload: Value,
    preview_bytes: usize,
) -> (Value, Option<String>) {
    if event_type != EventType::FileEdited {
        return (payload, None);
    }
    let Some(object) = payload.as_object_mut() else {
        return (payload, None);
    };
    let oversized =
        matches!(object.get("diff"), Some(Value::String(diff)) if diff.len() > preview_bytes);
    if !oversized {
        return (payload, None);
    }
    let Some(Value::String(diff)) = object.remove("diff") else {
        return (payload, None);
    };
    let mut cut = preview_bytes.min(diff.len());
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    object.insert("diff_preview".to_string(), json!(&diff[..cut]));
    object.insert("diff_truncated".to_string(), json!(true));
    object.insert("artifact_bytes".to_string(), json!(diff.len()));
    (payload, Some(diff))
}

#[async_trait]
impl SessionObserver for IngestPipeline {
    async fn on_transition(
        &self,
        session: &SandboxSession,
        from: SessionState,
        transition: &Transition,
    ) {
        let payload = json!({
            "from": from,
            "to": session.state,
            "cause": transition.name(),
            "reason": session.terminal_reason,
            "sandbox_id": session.sandbox_id,
            "task_id": session.task_id,
        });
        if let Err(err) = self
            .emit_system(&session.session_id, EventType::StateChanged, payload)
            .await
        {
            tracing::warn!(
                session_id = %session.session_id,
                error = %err,
                "Failed to record state change event"
            );
        }
        if session.is_terminal() {
            self.close_session(&session.session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::session::NewSession;
    use crate::store::{ControlStore, InMemoryControlStore};
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryControlStore>,
        registry: Arc<SessionRegistry>,
        bus: Arc<BroadcastBus>,
        pipeline: Arc<IngestPipeline>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryControlStore::new());
        let registry = Arc::new(SessionRegistry::new(store.clone(), Duration::from_secs(1)));
        let bus = Arc::new(BroadcastBus::default());
        let pipeline = Arc::new(IngestPipeline::new(
            IngestConfig {
                max_payload_bytes: 1024,
                preview_bytes: 16,
                backoff_base: Duration::from_millis(1),
                ..IngestConfig::default()
            },
            Duration::from_secs(1),
            registry.clone(),
            bus.clone(),
            Arc::new(LivenessTracker::new()),
            CancellationToken::new(),
        ));
        registry.add_observer(pipeline.clone());
        Harness {
            store,
            registry,
            bus,
            pipeline,
        }
    }

    async fn running_session(h: &Harness, task: &str) -> String {
        let session = h
            .registry
            .create_for_task(NewSession {
                task_id: task.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = session.session_id;
        h.registry
            .transition(
                &id,
                Transition::Provisioned {
                    sandbox_id: format!("sbx-{task}"),
                },
            )
            .await
            .unwrap();
        h.registry.transition(&id, Transition::Activated).await.unwrap();
        id
    }

    fn page(limit: usize) -> EventQuery {
        EventQuery {
            limit,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sequences_are_gap_free_and_resume_from_store() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let first = h
            .pipeline
            .ingest(&id, IncomingEvent::new(EventType::AgentStarted, json!({})))
            .await
            .unwrap();
        let second = h
            .pipeline
            .ingest(&id, IncomingEvent::new(EventType::AssistantMessage, json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(second.sequence, first.sequence + 1);

        // A fresh pipeline over the same store continues the sequence.
        let resumed = IngestPipeline::new(
            IngestConfig::default(),
            Duration::from_secs(1),
            h.registry.clone(),
            h.bus.clone(),
            Arc::new(LivenessTracker::new()),
            CancellationToken::new(),
        );
        let third = resumed
            .ingest(&id, IncomingEvent::new(EventType::AgentWaiting, json!({})))
            .await
            .unwrap();
        assert_eq!(third.sequence, second.sequence + 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_without_side_effects() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let before = h.store.max_sequence(&id).await.unwrap();
        let big = "x".repeat(2048);
        let err = h
            .pipeline
            .ingest(&id, IncomingEvent::new(EventType::Info, json!({ "text": big })))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        assert_eq!(h.store.max_sequence(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn terminal_sessions_reject_events() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        h.registry
            .transition(
                &id,
                Transition::Cancelled {
                    outcome: crate::session::CancelOutcome::Completed,
                    reason: "operator".into(),
                },
            )
            .await
            .unwrap();
        let before = h.store.max_sequence(&id).await.unwrap();
        let err = h
            .pipeline
            .ingest(&id, IncomingEvent::new(EventType::Info, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StateConflict { .. }));
        assert_eq!(h.store.max_sequence(&id).await.unwrap(), before);
        assert_eq!(h.pipeline.open_lanes(), 0);
    }

    #[tokio::test]
    async fn tier_one_is_broadcast_immediately() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let mut rx = h.bus.subscribe(&session_channel(&id));
        h.pipeline
            .ingest(&id, IncomingEvent::new(EventType::FileEdited, json!({"path": "a.rs"})))
            .await
            .unwrap();
        match rx.try_recv().unwrap() {
            BusMessage::Event { event } => assert_eq!(event.event_type, EventType::FileEdited),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_diffs_become_artifacts() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let diff = "+".repeat(100);
        let event = h
            .pipeline
            .ingest(
                &id,
                IncomingEvent::new(EventType::FileEdited, json!({"path": "a.rs", "diff": diff})),
            )
            .await
            .unwrap();
        assert_eq!(event.payload["diff_truncated"], json!(true));
        assert_eq!(event.payload["artifact_bytes"], json!(100));
        assert_eq!(event.payload["diff_preview"].as_str().unwrap().len(), 16);
        assert!(event.payload.get("diff").is_none());
        assert_eq!(h.pipeline.artifact(event.event_id).await.unwrap(), diff);
    }

    #[tokio::test]
    async fn store_failure_drops_event_and_reports_upstream() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let before = h.store.max_sequence(&id).await.unwrap();
        h.store.fail_next_appends(10);
        let err = h
            .pipeline
            .ingest(&id, IncomingEvent::new(EventType::AgentWaiting, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::UpstreamUnavailable(_)));
        h.store.fail_next_appends(0);

        let next = h
            .pipeline
            .ingest(&id, IncomingEvent::new(EventType::AgentWaiting, json!({})))
            .await
            .unwrap();
        assert_eq!(next.sequence, before + 1);
    }

    #[tokio::test]
    async fn first_heartbeat_activates_and_failure_fails() {
        let h = harness();
        let session = h
            .registry
            .create_for_task(NewSession {
                task_id: "t1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = session.session_id;
        h.registry
            .transition(
                &id,
                Transition::Provisioned {
                    sandbox_id: "sbx".into(),
                },
            )
            .await
            .unwrap();

        h.pipeline
            .ingest(&id, IncomingEvent::new(EventType::Heartbeat, json!({"status": "running"})))
            .await
            .unwrap();
        assert_eq!(h.registry.get(&id).await.unwrap().state, SessionState::Running);

        h.pipeline
            .ingest(&id, IncomingEvent::new(EventType::AgentFailed, json!({"error": "oom"})))
            .await
            .unwrap();
        let failed = h.registry.get(&id).await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert_eq!(failed.terminal_reason.as_deref(), Some("oom"));
    }

    #[tokio::test]
    async fn state_changes_are_recorded_as_events() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let history = h
            .pipeline
            .history(
                &id,
                &EventQuery {
                    event_types: Some(vec![EventType::StateChanged]),
                    ..page(10)
                },
            )
            .await
            .unwrap();
        let targets: Vec<_> = history
            .events
            .iter()
            .map(|e| e.payload["to"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(targets, vec!["CREATING", "RUNNING"]);
    }

    #[tokio::test]
    async fn workers_cannot_record_control_plane_events() {
        let h = harness();
        let id = running_session(&h, "t1").await;
        let before = h.store.max_sequence(&id).await.unwrap();

        for event_type in [
            EventType::StateChanged,
            EventType::SessionRestarted,
            EventType::MessageQueued,
        ] {
            let err = h
                .pipeline
                .ingest(&id, IncomingEvent::new(event_type, json!({})))
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::Validation(_)), "{event_type}");
        }
        let spoofed = IncomingEvent {
            source: EventSource::System,
            ..IncomingEvent::new(EventType::Info, json!({}))
        };
        let err = h.pipeline.ingest(&id, spoofed).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        assert_eq!(h.store.max_sequence(&id).await.unwrap(), before);
    }
}

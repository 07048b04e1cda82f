//! Per-session message & intervention queue.
//!
//! Messages are held in memory, one entry per live session. The entry is
//! created when the session is created and dropped on its terminal
//! transition; undelivered messages are discarded at that point.
//!
//! Delivery is destructive: a fetch removes what it returns. Urgent messages
//! always come out before normal ones; inside a class, order is enqueue
//! timestamp, then insertion counter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::ControlError;
use crate::events::EventType;
use crate::ingest::IngestPipeline;
use crate::session::{SandboxSession, SessionObserver, SessionRegistry, SessionState, Transition};

/// Characters of content echoed in the `message.queued` event.
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    #[serde(alias = "user_message")]
    User,
    Interrupt,
    #[serde(alias = "guardian_nudge")]
    GuardianIntervention,
    System,
}

impl MessageType {
    /// Priority used when the sender does not pick one.
    pub fn default_priority(self) -> Priority {
        match self {
            Self::Interrupt | Self::GuardianIntervention => Priority::Urgent,
            Self::User | Self::System => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}

/// How the worker should splice the message into its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectMode {
    /// Deliver at the next turn boundary.
    #[default]
    NextTurn,
    /// Interrupt the current turn.
    Immediate,
}

/// Control command delivered to the worker through its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    Pause,
    Resume,
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub session_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion counter; breaks enqueue-timestamp ties.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub inject_mode: InjectMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<SessionCommand>,
}

/// A message as submitted by an operator, the guardian or the router.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub content: String,
    pub message_type: MessageType,
    pub priority: Option<Priority>,
    pub source: Option<String>,
    pub inject_mode: InjectMode,
    pub command: Option<SessionCommand>,
}

impl NewMessage {
    pub fn command(command: SessionCommand) -> Self {
        let content = match &command {
            SessionCommand::Pause => "pause".to_string(),
            SessionCommand::Resume => "resume".to_string(),
            SessionCommand::Abort { reason } => match reason {
                Some(reason) => format!("abort: {reason}"),
                None => "abort".to_string(),
            },
        };
        let priority = match command {
            SessionCommand::Abort { .. } => Priority::Urgent,
            SessionCommand::Pause | SessionCommand::Resume => Priority::Normal,
        };
        Self {
            content,
            message_type: MessageType::System,
            priority: Some(priority),
            source: Some("operator".to_string()),
            inject_mode: InjectMode::Immediate,
            command: Some(command),
        }
    }
}

type QueueKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct SessionQueue {
    urgent: BTreeMap<QueueKey, QueuedMessage>,
    normal: BTreeMap<QueueKey, QueuedMessage>,
}

impl SessionQueue {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }

    fn class(&mut self, priority: Priority) -> &mut BTreeMap<QueueKey, QueuedMessage> {
        match priority {
            Priority::Urgent => &mut self.urgent,
            Priority::Normal => &mut self.normal,
        }
    }

    /// Remove and return the messages selected by `take`, urgent first.
    fn drain_where(&mut self, take: impl Fn(&QueuedMessage) -> bool) -> Vec<QueuedMessage> {
        let mut out = Vec::new();
        for class in [&mut self.urgent, &mut self.normal] {
            let keys: Vec<QueueKey> = class
                .iter()
                .filter(|(_, message)| take(message))
                .map(|(key, _)| *key)
                .collect();
            out.extend(keys.iter().filter_map(|key| class.remove(key)));
        }
        out
    }
}

pub struct MessageQueue {
    config: QueueConfig,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<IngestPipeline>,
    queues: DashMap<String, Arc<Mutex<SessionQueue>>>,
    counter: AtomicU64,
}

impl MessageQueue {
    pub fn new(
        config: QueueConfig,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<IngestPipeline>,
    ) -> Self {
        Self {
            config,
            registry,
            pipeline,
            queues: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<SessionQueue>> {
        self.queues
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn validate(&self, message: &NewMessage) -> Result<(), ControlError> {
        if message.content.trim().is_empty() {
            return Err(ControlError::validation("content must not be empty"));
        }
        if message.content.len() > self.config.max_content_bytes {
            return Err(ControlError::validation(format!(
                "content is {} bytes, limit is {}",
                message.content.len(),
                self.config.max_content_bytes
            )));
        }
        Ok(())
    }

    /// Queue a message for a live session and announce it with a
    /// `message.queued` event.
    pub async fn enqueue(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<QueuedMessage, ControlError> {
        self.validate(&message)?;

        // Held until the message is queued so a terminal transition cannot
        // tear the queue down underneath us.
        let _guard = self.registry.lock(session_id).await;
        let session = self.registry.get(session_id).await?;
        if session.is_terminal() {
            return Err(ControlError::StateConflict {
                session_id: session_id.to_string(),
                expected: "a non-terminal session".to_string(),
                actual: session.state,
            });
        }

        let queue = self.entry(session_id);
        let mut queue = queue.lock().await;
        if queue.len() >= self.config.max_pending {
            tracing::warn!(
                session_id,
                pending = queue.len(),
                "Message queue full; rejecting enqueue"
            );
            return Err(ControlError::RateLimited {
                retry_after: std::time::Duration::from_secs(1),
            });
        }

        let priority = message
            .priority
            .unwrap_or_else(|| message.message_type.default_priority());
        let queued = QueuedMessage {
            message_id: format!("msg-{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            content: message.content,
            message_type: message.message_type,
            priority,
            enqueued_at: Utc::now(),
            sequence: self.counter.fetch_add(1, Ordering::SeqCst),
            source: message.source,
            inject_mode: message.inject_mode,
            command: message.command,
        };
        queue
            .class(priority)
            .insert((queued.enqueued_at, queued.sequence), queued.clone());
        let pending = queue.len();
        drop(queue);

        let preview: String = queued.content.chars().take(PREVIEW_CHARS).collect();
        let announced = self
            .pipeline
            .emit_system(
                session_id,
                EventType::MessageQueued,
                json!({
                    "message_id": queued.message_id,
                    "message_type": queued.message_type,
                    "priority": queued.priority,
                    "content": preview,
                    "source": queued.source,
                }),
            )
            .await;
        if let Err(err) = announced {
            tracing::warn!(session_id, error = %err, "Message queued but announcement failed");
        }

        tracing::debug!(
            session_id,
            message_id = %queued.message_id,
            message_type = ?queued.message_type,
            priority = ?queued.priority,
            pending,
            "Message queued"
        );
        Ok(queued)
    }

    async fn ensure_live(&self, session_id: &str) -> Result<(), ControlError> {
        let session = self.registry.get(session_id).await?;
        if session.is_terminal() {
            return Err(ControlError::StateConflict {
                session_id: session_id.to_string(),
                expected: "a non-terminal session".to_string(),
                actual: session.state,
            });
        }
        Ok(())
    }

    /// Dequeue every pending message (commands excluded), urgent first.
    pub async fn fetch(&self, session_id: &str) -> Result<Vec<QueuedMessage>, ControlError> {
        self.ensure_live(session_id).await?;
        let Some(queue) = self.queues.get(session_id).map(|q| Arc::clone(q.value())) else {
            return Ok(Vec::new());
        };
        let messages = queue.lock().await.drain_where(|m| m.command.is_none());
        if !messages.is_empty() {
            tracing::debug!(session_id, count = messages.len(), "Messages delivered");
        }
        Ok(messages)
    }

    /// Dequeue pending commands only, for delivery with a heartbeat reply.
    pub async fn take_commands(&self, session_id: &str) -> Result<Vec<SessionCommand>, ControlError> {
        self.ensure_live(session_id).await?;
        let Some(queue) = self.queues.get(session_id).map(|q| Arc::clone(q.value())) else {
            return Ok(Vec::new());
        };
        let commands = queue
            .lock()
            .await
            .drain_where(|m| m.command.is_some())
            .into_iter()
            .filter_map(|m| m.command)
            .collect();
        Ok(commands)
    }

    pub async fn pending(&self, session_id: &str) -> usize {
        match self.queues.get(session_id).map(|q| Arc::clone(q.value())) {
            Some(queue) => queue.lock().await.len(),
            None => 0,
        }
    }

    /// Number of sessions with a live queue entry.
    pub fn tracked_sessions(&self) -> usize {
        self.queues.len()
    }
}

#[async_trait]
impl SessionObserver for MessageQueue {
    async fn on_created(&self, session: &SandboxSession) {
        self.entry(&session.session_id);
    }

    async fn on_transition(
        &self,
        session: &SandboxSession,
        _from: SessionState,
        _transition: &Transition,
    ) {
        if !session.is_terminal() {
            return;
        }
        if let Some((_, queue)) = self.queues.remove(&session.session_id) {
            let dropped = queue.lock().await.len();
            if dropped > 0 {
                tracing::info!(
                    session_id = %session.session_id,
                    dropped,
                    "Discarding undelivered messages for terminal session"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::config::IngestConfig;
    use crate::events::EventQuery;
    use crate::session::{CancelOutcome, NewSession};
    use crate::store::InMemoryControlStore;
    use crate::supervisor::LivenessTracker;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        registry: Arc<SessionRegistry>,
        pipeline: Arc<IngestPipeline>,
        queue: Arc<MessageQueue>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryControlStore::new());
        let registry = Arc::new(SessionRegistry::new(store, Duration::from_secs(1)));
        let pipeline = Arc::new(IngestPipeline::new(
            IngestConfig::default(),
            Duration::from_secs(1),
            registry.clone(),
            Arc::new(BroadcastBus::default()),
            Arc::new(LivenessTracker::new()),
            CancellationToken::new(),
        ));
        let queue = Arc::new(MessageQueue::new(
            QueueConfig {
                max_content_bytes: 64,
                max_pending: 4,
                ..QueueConfig::default()
            },
            registry.clone(),
            pipeline.clone(),
        ));
        registry.add_observer(pipeline.clone());
        registry.add_observer(queue.clone());
        Harness {
            registry,
            pipeline,
            queue,
        }
    }

    async fn session(h: &Harness, task: &str) -> String {
        h.registry
            .create_for_task(NewSession {
                task_id: task.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .session_id
    }

    fn text(content: &str, priority: Priority) -> NewMessage {
        NewMessage {
            content: content.to_string(),
            priority: Some(priority),
            ..Default::default()
        }
    }

    fn contents(messages: &[QueuedMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn polling_is_fifo_and_destructive() {
        let h = harness();
        let id = session(&h, "t1").await;
        for content in ["A", "B", "C"] {
            h.queue.enqueue(&id, text(content, Priority::Normal)).await.unwrap();
        }
        assert_eq!(contents(&h.queue.fetch(&id).await.unwrap()), vec!["A", "B", "C"]);
        assert!(h.queue.fetch(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn urgent_jumps_ahead_of_normal() {
        let h = harness();
        let id = session(&h, "t1").await;
        h.queue.enqueue(&id, text("X", Priority::Normal)).await.unwrap();
        h.queue.enqueue(&id, text("Y", Priority::Urgent)).await.unwrap();
        h.queue.enqueue(&id, text("Z", Priority::Urgent)).await.unwrap();
        assert_eq!(contents(&h.queue.fetch(&id).await.unwrap()), vec!["Y", "Z", "X"]);
    }

    #[tokio::test]
    async fn interrupts_default_to_urgent() {
        let h = harness();
        let id = session(&h, "t1").await;
        let queued = h
            .queue
            .enqueue(
                &id,
                NewMessage {
                    content: "stop".into(),
                    message_type: MessageType::Interrupt,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(queued.priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let h = harness();
        let s1 = session(&h, "t1").await;
        let s2 = session(&h, "t2").await;
        h.queue.enqueue(&s1, text("A1", Priority::Normal)).await.unwrap();
        h.queue.enqueue(&s2, text("B2", Priority::Normal)).await.unwrap();
        assert_eq!(contents(&h.queue.fetch(&s1).await.unwrap()), vec!["A1"]);
        assert_eq!(contents(&h.queue.fetch(&s2).await.unwrap()), vec!["B2"]);
    }

    #[tokio::test]
    async fn rejects_empty_oversized_and_overflow() {
        let h = harness();
        let id = session(&h, "t1").await;
        assert!(matches!(
            h.queue.enqueue(&id, text("  ", Priority::Normal)).await,
            Err(ControlError::Validation(_))
        ));
        assert!(matches!(
            h.queue.enqueue(&id, text(&"x".repeat(65), Priority::Normal)).await,
            Err(ControlError::Validation(_))
        ));
        for n in 0..4 {
            h.queue
                .enqueue(&id, text(&format!("m{n}"), Priority::Normal))
                .await
                .unwrap();
        }
        assert!(matches!(
            h.queue.enqueue(&id, text("one too many", Priority::Normal)).await,
            Err(ControlError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_session_rejects_and_releases_queue() {
        let h = harness();
        let id = session(&h, "t1").await;
        h.queue.enqueue(&id, text("lost", Priority::Normal)).await.unwrap();
        h.registry
            .transition(
                &id,
                Transition::Cancelled {
                    outcome: CancelOutcome::Failed,
                    reason: "operator".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.queue.tracked_sessions(), 0);
        assert!(matches!(
            h.queue.enqueue(&id, text("late", Priority::Normal)).await,
            Err(ControlError::StateConflict { .. })
        ));
        assert!(matches!(
            h.queue.fetch(&id).await,
            Err(ControlError::StateConflict { .. })
        ));
        assert!(matches!(
            h.queue.fetch("nope").await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn commands_are_drained_separately() {
        let h = harness();
        let id = session(&h, "t1").await;
        h.queue.enqueue(&id, text("hello", Priority::Normal)).await.unwrap();
        h.queue
            .enqueue(&id, NewMessage::command(SessionCommand::Pause))
            .await
            .unwrap();

        assert_eq!(h.queue.take_commands(&id).await.unwrap(), vec![SessionCommand::Pause]);
        assert!(h.queue.take_commands(&id).await.unwrap().is_empty());
        assert_eq!(contents(&h.queue.fetch(&id).await.unwrap()), vec!["hello"]);
    }

    #[tokio::test]
    async fn enqueue_announces_message() {
        let h = harness();
        let id = session(&h, "t1").await;
        let queued = h
            .queue
            .enqueue(&id, text(&"y".repeat(60), Priority::Normal))
            .await
            .unwrap();
        let events = h
            .pipeline
            .history(
                &id,
                &EventQuery {
                    event_types: Some(vec![EventType::MessageQueued]),
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(events.events.len(), 1);
        assert_eq!(events.events[0].payload["message_id"], json!(queued.message_id));
    }

    #[test]
    fn legacy_type_names_are_accepted() {
        let t: MessageType = serde_json::from_value(json!("guardian_nudge")).unwrap();
        assert_eq!(t, MessageType::GuardianIntervention);
        let t: MessageType = serde_json::from_value(json!("user_message")).unwrap();
        assert_eq!(t, MessageType::User);
        let cmd: SessionCommand = serde_json::from_value(json!({"command": "abort"})).unwrap();
        assert_eq!(cmd, SessionCommand::Abort { reason: None });
    }
}

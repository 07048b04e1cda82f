//! Session event catalogue and the persisted event record.
//!
//! Every event type has a fixed category and delivery tier. Tier 1 events
//! are broadcast the moment they are accepted; Tier 2 events are coalesced
//! into periodic batches per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of event types accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.waiting")]
    AgentWaiting,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.interrupted")]
    AgentInterrupted,
    #[serde(rename = "agent.failed")]
    AgentFailed,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.file_edited")]
    FileEdited,
    #[serde(rename = "agent.message_chunk")]
    MessageChunk,
    #[serde(rename = "agent.assistant_message")]
    AssistantMessage,
    #[serde(rename = "agent.message_injected")]
    MessageInjected,
    #[serde(rename = "agent.tool_use")]
    ToolUse,
    #[serde(rename = "agent.tool_completed")]
    ToolCompleted,
    #[serde(rename = "agent.thinking")]
    Thinking,
    #[serde(rename = "agent.info")]
    Info,
    #[serde(rename = "agent.heartbeat")]
    Heartbeat,
    #[serde(rename = "message.queued")]
    MessageQueued,
    #[serde(rename = "session.state_changed")]
    StateChanged,
    #[serde(rename = "session.restarted")]
    SessionRestarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Message,
    Tool,
    File,
    Error,
    Heartbeat,
}

/// Delivery tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Broadcast immediately, retained forever.
    Immediate = 1,
    /// Batched on a timer, deleted after the warm window.
    Batched = 2,
}

impl Serialize for Tier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Tier::Immediate),
            2 => Ok(Tier::Batched),
            other => Err(serde::de::Error::custom(format!("unknown tier {other}"))),
        }
    }
}

impl Tier {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Tier::Immediate),
            2 => Some(Tier::Batched),
            _ => None,
        }
    }
}

impl EventType {
    pub const ALL: [EventType; 18] = [
        EventType::AgentStarted,
        EventType::AgentWaiting,
        EventType::AgentCompleted,
        EventType::AgentInterrupted,
        EventType::AgentFailed,
        EventType::AgentError,
        EventType::FileEdited,
        EventType::MessageChunk,
        EventType::AssistantMessage,
        EventType::MessageInjected,
        EventType::ToolUse,
        EventType::ToolCompleted,
        EventType::Thinking,
        EventType::Info,
        EventType::Heartbeat,
        EventType::MessageQueued,
        EventType::StateChanged,
        EventType::SessionRestarted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent.started",
            Self::AgentWaiting => "agent.waiting",
            Self::AgentCompleted => "agent.completed",
            Self::AgentInterrupted => "agent.interrupted",
            Self::AgentFailed => "agent.failed",
            Self::AgentError => "agent.error",
            Self::FileEdited => "agent.file_edited",
            Self::MessageChunk => "agent.message_chunk",
            Self::AssistantMessage => "agent.assistant_message",
            Self::MessageInjected => "agent.message_injected",
            Self::ToolUse => "agent.tool_use",
            Self::ToolCompleted => "agent.tool_completed",
            Self::Thinking => "agent.thinking",
            Self::Info => "agent.info",
            Self::Heartbeat => "agent.heartbeat",
            Self::MessageQueued => "message.queued",
            Self::StateChanged => "session.state_changed",
            Self::SessionRestarted => "session.restarted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    pub fn category(self) -> EventCategory {
        match self {
            Self::AgentStarted
            | Self::AgentWaiting
            | Self::AgentCompleted
            | Self::AgentInterrupted
            | Self::StateChanged
            | Self::SessionRestarted => EventCategory::Lifecycle,
            Self::AgentFailed | Self::AgentError => EventCategory::Error,
            Self::FileEdited => EventCategory::File,
            Self::MessageChunk
            | Self::AssistantMessage
            | Self::MessageInjected
            | Self::MessageQueued => EventCategory::Message,
            Self::ToolUse | Self::ToolCompleted | Self::Thinking | Self::Info => {
                EventCategory::Tool
            }
            Self::Heartbeat => EventCategory::Heartbeat,
        }
    }

    pub fn tier(self) -> Tier {
        match self.category() {
            EventCategory::Tool | EventCategory::Heartbeat => Tier::Batched,
            _ => Tier::Immediate,
        }
    }

    /// Whether this event proves the worker is making progress.
    ///
    /// Everything outside a short list of non-work types counts, so new
    /// event types never make a busy worker look idle.
    pub fn is_work(self) -> bool {
        !matches!(
            self.category(),
            EventCategory::Lifecycle | EventCategory::Heartbeat | EventCategory::Error
        )
    }

    /// Types only the control plane may record. Workers submitting them
    /// could forge state changes, restarts or queue announcements.
    pub fn is_control_plane_only(self) -> bool {
        matches!(
            self,
            Self::StateChanged | Self::SessionRestarted | Self::MessageQueued
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    #[default]
    Agent,
    Worker,
    System,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Worker => "worker",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(Self::Agent),
            "worker" => Some(Self::Worker),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A persisted, sequenced session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_id: Uuid,
    pub session_id: String,
    /// Strictly increasing per session, starting at 1.
    pub sequence: u64,
    pub event_type: EventType,
    pub category: EventCategory,
    pub tier: Tier,
    pub source: EventSource,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event as submitted, before it is sequenced.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub source: EventSource,
}

impl IncomingEvent {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            source: EventSource::Agent,
        }
    }

    pub fn system(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            source: EventSource::System,
        }
    }
}

/// Filter and pagination for event history reads.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_types: Option<Vec<EventType>>,
    pub after_sequence: Option<u64>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<SessionEvent>,
    pub total_count: usize,
}

//! Pub/sub fan-out of session events to live subscribers.
//!
//! Each session has its own channel (`sandbox:{session_id}`); every message
//! is mirrored to the monitor channel so dashboards can watch all sessions.
//! Delivery is best-effort: persistence is the source of truth and a
//! publish with no subscribers is not an error.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::SessionEvent;

pub const MONITOR_CHANNEL: &str = "sandbox:all";

pub fn session_channel(session_id: &str) -> String {
    format!("sandbox:{session_id}")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Message published on a channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// A single Tier-1 event.
    Event { event: SessionEvent },
    /// A flushed batch of Tier-2 events, ordered by sequence.
    Batch {
        session_id: String,
        events: Vec<SessionEvent>,
    },
}

impl BusMessage {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Event { event } => &event.session_id,
            Self::Batch { session_id, .. } => session_id,
        }
    }

    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Event { .. } => "event",
            Self::Batch { .. } => "batch",
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish on `channel`, returning the number of receivers reached.
    async fn publish(&self, channel: &str, message: BusMessage) -> Result<usize, BusError>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage>;

    /// Release a channel whose session has ended.
    fn close(&self, _channel: &str) {}
}

/// In-process bus backed by one broadcast channel per topic.
pub struct BroadcastBus {
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
    capacity: usize,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, channel: &str, message: BusMessage) -> Result<usize, BusError> {
        let Some(sender) = self.channels.get(channel).map(|s| s.clone()) else {
            return Ok(0);
        };
        // A send error only means nobody is listening right now.
        Ok(sender.send(message).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(channel).subscribe()
    }

    /// Open receivers observe `Closed` once the last sender is dropped.
    fn close(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSource, EventType};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(session_id: &str) -> SessionEvent {
        SessionEvent {
            event_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            sequence: 1,
            event_type: EventType::AgentStarted,
            category: EventType::AgentStarted.category(),
            tier: EventType::AgentStarted.tier(),
            source: EventSource::Agent,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = BroadcastBus::default();
        let reached = bus
            .publish(&session_channel("s1"), BusMessage::Event { event: event("s1") })
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = BroadcastBus::default();
        let mut s1 = bus.subscribe(&session_channel("s1"));
        let mut s2 = bus.subscribe(&session_channel("s2"));

        bus.publish(&session_channel("s1"), BusMessage::Event { event: event("s1") })
            .await
            .unwrap();

        let got = s1.recv().await.unwrap();
        assert_eq!(got.session_id(), "s1");
        assert!(matches!(
            s2.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn bus_message_is_tagged() {
        let json = serde_json::to_value(BusMessage::Batch {
            session_id: "s1".into(),
            events: vec![],
        })
        .unwrap();
        assert_eq!(json["type"], "batch");
        assert_eq!(json["session_id"], "s1");
    }
}

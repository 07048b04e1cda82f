//! Tier-2 batching: one task per session buffers events and publishes them
//! as a single batch on a fixed timer, or early when the buffer fills.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::{session_channel, BusMessage, EventBus, MONITOR_CHANNEL};
use crate::events::SessionEvent;
use crate::retry::{retry_with_backoff, BackoffConfig};

pub struct Tier2Batcher {
    tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Tier2Batcher {
    pub fn spawn(
        session_id: String,
        bus: Arc<dyn EventBus>,
        flush_interval: Duration,
        cap: usize,
        backoff: BackoffConfig,
        parent: &CancellationToken,
    ) -> Self {
        let cap = cap.max(1);
        let (tx, rx) = mpsc::channel(cap * 4);
        let cancel = parent.child_token();
        let task = tokio::spawn(run(
            session_id,
            rx,
            bus,
            flush_interval,
            cap,
            backoff,
            cancel.clone(),
        ));
        Self { tx, cancel, task }
    }

    /// Queue an event for the next batch. Waits if the batcher is behind.
    pub async fn push(&self, event: SessionEvent) {
        if let Err(err) = self.tx.send(event).await {
            tracing::warn!(
                session_id = %err.0.session_id,
                sequence = err.0.sequence,
                "Tier-2 batcher stopped; event persisted but not broadcast"
            );
        }
    }

    /// Flush whatever is buffered and stop the task.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "Tier-2 batcher task ended abnormally");
        }
    }
}

async fn run(
    session_id: String,
    mut rx: mpsc::Receiver<SessionEvent>,
    bus: Arc<dyn EventBus>,
    flush_interval: Duration,
    cap: usize,
    backoff: BackoffConfig,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<SessionEvent> = Vec::with_capacity(cap);
    let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    buffer.push(event);
                }
                flush(&session_id, &mut buffer, bus.as_ref(), &backoff).await;
                break;
            }
            received = rx.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= cap {
                        flush(&session_id, &mut buffer, bus.as_ref(), &backoff).await;
                    }
                }
                None => {
                    flush(&session_id, &mut buffer, bus.as_ref(), &backoff).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(&session_id, &mut buffer, bus.as_ref(), &backoff).await;
            }
        }
    }
    tracing::debug!(session_id = %session_id, "Tier-2 batcher stopped");
}

async fn flush(
    session_id: &str,
    buffer: &mut Vec<SessionEvent>,
    bus: &dyn EventBus,
    backoff: &BackoffConfig,
) {
    if buffer.is_empty() {
        return;
    }
    let mut events = std::mem::take(buffer);
    events.sort_by_key(|e| e.sequence);
    let count = events.len();
    let message = BusMessage::Batch {
        session_id: session_id.to_string(),
        events,
    };
    for channel in [session_channel(session_id), MONITOR_CHANNEL.to_string()] {
        let target = channel.as_str();
        let message = &message;
        let result = retry_with_backoff("publish_batch", backoff, |_| true, move || {
            bus.publish(target, message.clone())
        })
        .await;
        if let Err(err) = result {
            tracing::error!(
                session_id,
                channel = %channel,
                count,
                error = %err,
                "Dropping Tier-2 batch broadcast"
            );
        }
    }
    tracing::trace!(session_id, count, "Tier-2 batch flushed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::events::{EventSource, EventType};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(session_id: &str, sequence: u64) -> SessionEvent {
        SessionEvent {
            event_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            sequence,
            event_type: EventType::ToolUse,
            category: EventType::ToolUse.category(),
            tier: EventType::ToolUse.tier(),
            source: EventSource::Agent,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn batch_sequences(message: BusMessage) -> Vec<u64> {
        match message {
            BusMessage::Batch { events, .. } => events.iter().map(|e| e.sequence).collect(),
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_timer() {
        let bus = Arc::new(BroadcastBus::default());
        let mut rx = bus.subscribe(&session_channel("s1"));
        let root = CancellationToken::new();
        let batcher = Tier2Batcher::spawn(
            "s1".into(),
            bus.clone(),
            Duration::from_millis(500),
            50,
            BackoffConfig::default(),
            &root,
        );
        batcher.push(event("s1", 1)).await;
        batcher.push(event("s1", 2)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(batch_sequences(rx.recv().await.unwrap()), vec![1, 2]);
        batcher.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_early_at_cap() {
        let bus = Arc::new(BroadcastBus::default());
        let mut rx = bus.subscribe(&session_channel("s1"));
        let root = CancellationToken::new();
        let batcher = Tier2Batcher::spawn(
            "s1".into(),
            bus.clone(),
            Duration::from_secs(60),
            3,
            BackoffConfig::default(),
            &root,
        );
        for seq in 1..=3 {
            batcher.push(event("s1", seq)).await;
        }
        assert_eq!(batch_sequences(rx.recv().await.unwrap()), vec![1, 2, 3]);
        batcher.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_remaining_events() {
        let bus = Arc::new(BroadcastBus::default());
        let mut rx = bus.subscribe(&session_channel("s1"));
        let root = CancellationToken::new();
        let batcher = Tier2Batcher::spawn(
            "s1".into(),
            bus.clone(),
            Duration::from_secs(60),
            50,
            BackoffConfig::default(),
            &root,
        );
        batcher.push(event("s1", 7)).await;
        batcher.close().await;
        assert_eq!(batch_sequences(rx.recv().await.unwrap()), vec![7]);
    }
}

//! In-memory liveness bookkeeping fed by heartbeats and events.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::events::EventType;

/// Activity reported by the worker in its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerActivity {
    #[default]
    Running,
    Idle,
    Waiting,
}

impl WorkerActivity {
    /// Unknown statuses count as running, which carries the shorter TTL.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "idle" => Self::Idle,
            "waiting" | "waiting_for_input" | "blocked" => Self::Waiting,
            _ => Self::Running,
        }
    }

    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle | Self::Waiting)
    }
}

#[derive(Debug, Clone)]
pub struct Liveness {
    /// When tracking started; bounds the time a session may spend CREATING.
    pub registered_at: Instant,
    /// Last heartbeat or event of any kind.
    pub last_seen: Instant,
    /// Last event that represents actual work.
    pub last_work: Instant,
    pub activity: WorkerActivity,
    /// Missed intervals already reported, so each miss is warned once.
    pub warned_misses: u32,
}

impl Liveness {
    fn fresh(now: Instant) -> Self {
        Self {
            registered_at: now,
            last_seen: now,
            last_work: now,
            activity: WorkerActivity::Running,
            warned_misses: 0,
        }
    }
}

#[derive(Default)]
pub struct LivenessTracker {
    entries: DashMap<String, Liveness>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a session as if it had just been seen.
    pub fn register(&self, session_id: &str) {
        self.entries
            .insert(session_id.to_string(), Liveness::fresh(Instant::now()));
    }

    /// Track a session if it is not tracked yet.
    pub fn ensure(&self, session_id: &str) {
        self.entries
            .entry(session_id.to_string())
            .or_insert_with(|| Liveness::fresh(Instant::now()));
    }

    /// Track a session last heard from `silent_for` ago.
    ///
    /// Used on startup so sessions that went quiet while the control plane
    /// was down are not granted a fresh TTL.
    pub fn restore(&self, session_id: &str, silent_for: Duration) {
        let now = Instant::now();
        let seen = now.checked_sub(silent_for).unwrap_or(now);
        self.entries.insert(
            session_id.to_string(),
            Liveness {
                registered_at: seen,
                last_seen: seen,
                last_work: seen,
                activity: WorkerActivity::Running,
                warned_misses: 0,
            },
        );
    }

    pub fn record_heartbeat(&self, session_id: &str, activity: WorkerActivity) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| Liveness::fresh(now));
        entry.last_seen = now;
        entry.activity = activity;
        entry.warned_misses = 0;
    }

    pub fn record_event(&self, session_id: &str, event_type: EventType) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| Liveness::fresh(now));
        entry.last_seen = now;
        entry.warned_misses = 0;
        if event_type.is_work() {
            entry.last_work = now;
            entry.activity = WorkerActivity::Running;
        }
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Liveness> {
        self.entries.get(session_id).map(|e| e.clone())
    }

    pub fn set_warned(&self, session_id: &str, misses: u32) {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            entry.warned_misses = misses;
        }
    }

    pub fn forget(&self, session_id: &str) {
        self.entries.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_counts_as_running() {
        assert_eq!(WorkerActivity::parse("IDLE"), WorkerActivity::Idle);
        assert_eq!(WorkerActivity::parse("waiting"), WorkerActivity::Waiting);
        assert_eq!(WorkerActivity::parse("compiling"), WorkerActivity::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_refresh_liveness_but_not_work() {
        let tracker = LivenessTracker::new();
        tracker.register("s1");
        let start = tracker.snapshot("s1").unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        tracker.record_heartbeat("s1", WorkerActivity::Idle);
        let after = tracker.snapshot("s1").unwrap();
        assert!(after.last_seen > start.last_seen);
        assert_eq!(after.last_work, start.last_work);
        assert_eq!(after.activity, WorkerActivity::Idle);

        tokio::time::advance(Duration::from_secs(10)).await;
        tracker.record_event("s1", EventType::ToolUse);
        let worked = tracker.snapshot("s1").unwrap();
        assert!(worked.last_work > after.last_work);
        assert_eq!(worked.activity, WorkerActivity::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn restored_sessions_keep_their_silence() {
        tokio::time::advance(Duration::from_secs(600)).await;
        let tracker = LivenessTracker::new();
        tracker.restore("s1", Duration::from_secs(90));
        let entry = tracker.snapshot("s1").unwrap();
        assert_eq!(entry.last_seen.elapsed(), Duration::from_secs(90));
    }
}

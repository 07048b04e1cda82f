//! Per-session sliding-window rate limits.
//!
//! Each (session, endpoint class) pair keeps the timestamps of accepted
//! requests inside the window. A request is rejected only when the window
//! is already full, so the limit never penalizes requests under it and one
//! session's traffic never affects another's.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Events,
    Heartbeats,
    Polls,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Heartbeats => "heartbeats",
            Self::Polls => "polls",
        }
    }
}

#[derive(Debug, Default)]
struct SessionWindows {
    events: VecDeque<Instant>,
    heartbeats: VecDeque<Instant>,
    polls: VecDeque<Instant>,
}

impl SessionWindows {
    fn window_mut(&mut self, class: EndpointClass) -> &mut VecDeque<Instant> {
        match class {
            EndpointClass::Events => &mut self.events,
            EndpointClass::Heartbeats => &mut self.heartbeats,
            EndpointClass::Polls => &mut self.polls,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, SessionWindows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    fn limit_for(&self, class: EndpointClass) -> usize {
        let limit = match class {
            EndpointClass::Events => self.config.events_per_window,
            EndpointClass::Heartbeats => self.config.heartbeats_per_window,
            EndpointClass::Polls => self.config.polls_per_window,
        };
        limit as usize
    }

    /// Record a request, or reject it with the time until a slot frees up.
    pub fn check(&self, session_id: &str, class: EndpointClass) -> Result<(), ControlError> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let window = self.config.window;
        let limit = self.limit_for(class);

        let mut entry = self.windows.entry(session_id.to_string()).or_default();
        let stamps = entry.window_mut(class);
        while let Some(oldest) = stamps.front() {
            if now.duration_since(*oldest) >= window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= limit {
            let retry_after = stamps
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window)
                .max(Duration::from_secs(1));
            tracing::warn!(
                session_id,
                class = class.as_str(),
                limit,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            return Err(ControlError::RateLimited { retry_after });
        }
        stamps.push_back(now);
        Ok(())
    }

    /// Drop all windows for a session.
    pub fn forget(&self, session_id: &str) {
        self.windows.remove(session_id);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(events: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(60),
            events_per_window: events,
            heartbeats_per_window: 2,
            polls_per_window: 2,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_excess_is_rejected() {
        let limiter = limiter(3);
        for _ in 0..3 {
            limiter.check("s1", EndpointClass::Events).unwrap();
        }
        let err = limiter.check("s1", EndpointClass::Events).unwrap_err();
        assert!(matches!(err, ControlError::RateLimited { .. }));
        // Other classes and other sessions are unaffected.
        limiter.check("s1", EndpointClass::Polls).unwrap();
        limiter.check("s2", EndpointClass::Events).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = limiter(2);
        limiter.check("s1", EndpointClass::Events).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.check("s1", EndpointClass::Events).unwrap();

        match limiter.check("s1", EndpointClass::Events) {
            Err(ControlError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        limiter.check("s1", EndpointClass::Events).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forget_releases_session_state() {
        let limiter = limiter(1);
        limiter.check("s1", EndpointClass::Events).unwrap();
        assert_eq!(limiter.tracked_sessions(), 1);
        limiter.forget("s1");
        assert_eq!(limiter.tracked_sessions(), 0);
        limiter.check("s1", EndpointClass::Events).unwrap();
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            events_per_window: 0,
            ..RateLimitConfig::default()
        });
        for _ in 0..10 {
            limiter.check("s1", EndpointClass::Events).unwrap();
        }
    }
}

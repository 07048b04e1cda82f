//! Hook-mode delivery: the worker-side local queue consulted before every
//! action.
//!
//! Instead of polling the server on each step, the local queue refills from
//! its source every `refill_every` actions. Worst-case delivery latency is
//! therefore one refill period of actions rather than one poll interval.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ControlError;
use crate::queue::{MessageQueue, QueuedMessage};

/// Where a hook queue pulls pending messages from. Fetching consumes them.
#[async_trait]
pub trait InterventionSource: Send + Sync {
    async fn fetch(&self, session_id: &str) -> Result<Vec<QueuedMessage>, ControlError>;
}

#[async_trait]
impl InterventionSource for MessageQueue {
    async fn fetch(&self, session_id: &str) -> Result<Vec<QueuedMessage>, ControlError> {
        MessageQueue::fetch(self, session_id).await
    }
}

/// Remote source: `GET {base}/sessions/{id}/interventions` with the
/// session's bearer token.
pub struct HttpInterventionSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpInterventionSource {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::UpstreamUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl InterventionSource for HttpInterventionSource {
    async fn fetch(&self, session_id: &str) -> Result<Vec<QueuedMessage>, ControlError> {
        let response = self
            .client
            .get(format!("{}/sessions/{}/interventions", self.base_url, session_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ControlError::UpstreamUnavailable(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ControlError::Unauthorized("control plane rejected session token".into()));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ControlError::not_found(format!("session {session_id}")));
        }
        if !status.is_success() {
            return Err(ControlError::UpstreamUnavailable(format!(
                "intervention poll returned {status}"
            )));
        }
        response
            .json::<Vec<QueuedMessage>>()
            .await
            .map_err(|e| ControlError::UpstreamUnavailable(format!("bad intervention payload: {e}")))
    }
}

pub struct HookQueue {
    session_id: String,
    source: Arc<dyn InterventionSource>,
    refill_every: usize,
    actions: usize,
    local: VecDeque<QueuedMessage>,
}

impl HookQueue {
    pub fn new(
        session_id: impl Into<String>,
        source: Arc<dyn InterventionSource>,
        refill_every: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            refill_every: refill_every.max(1),
            actions: 0,
            local: VecDeque::new(),
        }
    }

    /// Called by the execution loop before each action. Returns the next
    /// message to inject, if any.
    pub async fn next_action(&mut self) -> Option<QueuedMessage> {
        if self.actions % self.refill_every == 0 {
            self.refill().await;
        }
        self.actions = self.actions.wrapping_add(1);
        self.local.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.local.len()
    }

    async fn refill(&mut self) {
        match self.source.fetch(&self.session_id).await {
            Ok(fetched) if fetched.is_empty() => {}
            Ok(fetched) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    fetched = fetched.len(),
                    "Hook queue refilled"
                );
                self.local.extend(fetched);
                // Stable: keeps FIFO order inside each priority class.
                self.local
                    .make_contiguous()
                    .sort_by(|a, b| b.priority.cmp(&a.priority));
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "Hook queue refill failed; keeping local messages"
                );
            }
        }
    }
}

//! Intervention routing: sandbox queue when the task is bound to a session,
//! the direct-delivery collaborator when it never was.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::queue::{InjectMode, MessageQueue, MessageType, NewMessage, Priority, QueuedMessage};
use crate::session::SessionRegistry;

/// A steering message for whatever is executing a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervention {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default = "urgent")]
    pub priority: Priority,
    #[serde(default)]
    pub inject_mode: InjectMode,
}

fn urgent() -> Priority {
    Priority::Urgent
}

/// Delivery path for tasks that do not run in a sandbox.
#[async_trait]
pub trait DirectDelivery: Send + Sync {
    async fn deliver(&self, task_id: &str, intervention: &Intervention) -> Result<(), ControlError>;
}

/// Posts interventions as JSON to `{url}` with the task id attached.
pub struct WebhookDirectDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDirectDelivery {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::UpstreamUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DirectDelivery for WebhookDirectDelivery {
    async fn deliver(&self, task_id: &str, intervention: &Intervention) -> Result<(), ControlError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "task_id": task_id,
                "intervention": intervention,
            }))
            .send()
            .await
            .map_err(|e| ControlError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ControlError::UpstreamUnavailable(format!(
                "direct delivery returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Used when no direct channel is configured: every legacy delivery fails.
pub struct NoDirectDelivery;

#[async_trait]
impl DirectDelivery for NoDirectDelivery {
    async fn deliver(&self, task_id: &str, _intervention: &Intervention) -> Result<(), ControlError> {
        Err(ControlError::UpstreamUnavailable(format!(
            "task {task_id} has no sandbox session and no direct delivery channel is configured"
        )))
    }
}

/// Where an intervention ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum RouteOutcome {
    Sandbox {
        session_id: String,
        message: QueuedMessage,
    },
    Direct {
        task_id: String,
    },
}

pub struct InterventionRouter {
    registry: Arc<SessionRegistry>,
    queue: Arc<MessageQueue>,
    direct: Arc<dyn DirectDelivery>,
}

impl InterventionRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        queue: Arc<MessageQueue>,
        direct: Arc<dyn DirectDelivery>,
    ) -> Self {
        Self {
            registry,
            queue,
            direct,
        }
    }

    /// Deliver through exactly one channel.
    ///
    /// A binding that points at a missing or terminal session is an error;
    /// it never falls back to direct delivery.
    pub async fn route(
        &self,
        task_id: &str,
        intervention: Intervention,
    ) -> Result<RouteOutcome, ControlError> {
        if intervention.message.trim().is_empty() {
            return Err(ControlError::validation("message must not be empty"));
        }

        let Some(session_id) = self.registry.task_binding(task_id).await? else {
            self.direct.deliver(task_id, &intervention).await?;
            tracing::info!(task_id, "Intervention delivered directly");
            return Ok(RouteOutcome::Direct {
                task_id: task_id.to_string(),
            });
        };

        let session = self.registry.find(&session_id).await?.ok_or_else(|| {
            tracing::warn!(task_id, session_id = %session_id, "Task bound to unknown session");
            ControlError::not_found(format!("session {session_id} bound to task {task_id}"))
        })?;
        if session.is_terminal() {
            return Err(ControlError::StateConflict {
                session_id,
                expected: "a live session bound to the task".to_string(),
                actual: session.state,
            });
        }

        let message = self
            .queue
            .enqueue(
                &session_id,
                NewMessage {
                    content: intervention.message,
                    message_type: MessageType::GuardianIntervention,
                    priority: Some(intervention.priority),
                    source: intervention.source,
                    inject_mode: intervention.inject_mode,
                    command: None,
                },
            )
            .await?;
        tracing::info!(
            task_id,
            session_id = %session_id,
            message_id = %message.message_id,
            "Intervention routed to sandbox"
        );
        Ok(RouteOutcome::Sandbox { session_id, message })
    }
}

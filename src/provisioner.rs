//! Sandbox provisioning collaborator.
//!
//! The control plane never runs sandboxes itself. It asks a provisioner to
//! create one (receiving an opaque sandbox id) and to terminate it, first
//! gracefully and then by force.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioner rejected request: {0}")]
    Rejected(String),

    #[error("provisioner unavailable: {0}")]
    Unavailable(String),

    #[error("sandbox {0} not found")]
    NotFound(String),
}

/// What a new sandbox needs to connect back to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSpec {
    pub session_id: String,
    pub task_id: String,
    /// Bearer token the worker presents on every call.
    pub session_token: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub resources: serde_json::Value,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request a sandbox; returns its external id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, ProvisionError>;

    /// Ask the sandbox to stop, waiting at most `grace` for it to exit.
    async fn terminate(&self, sandbox_id: &str, grace: Duration) -> Result<(), ProvisionError>;

    async fn force_terminate(&self, sandbox_id: &str) -> Result<(), ProvisionError>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

/// Provisioner reached over HTTP.
///
/// `POST {base}/sandboxes` creates, `POST {base}/sandboxes/{id}/stop` stops
/// gracefully, `DELETE {base}/sandboxes/{id}` force-terminates.
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .user_agent("sandbox-control")
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn classify(sandbox_id: &str, status: reqwest::StatusCode, body: String) -> ProvisionError {
        if status == reqwest::StatusCode::NOT_FOUND {
            ProvisionError::NotFound(sandbox_id.to_string())
        } else if status.is_client_error() {
            ProvisionError::Rejected(format!("{status}: {body}"))
        } else {
            ProvisionError::Unavailable(format!("{status}: {body}"))
        }
    }
}

fn unavailable(err: reqwest::Error) -> ProvisionError {
    ProvisionError::Unavailable(err.to_string())
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, ProvisionError> {
        let response = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .json(spec)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(&spec.session_id, status, body));
        }
        let created: CreateResponse = response.json().await.map_err(unavailable)?;
        Ok(created.sandbox_id)
    }

    async fn terminate(&self, sandbox_id: &str, grace: Duration) -> Result<(), ProvisionError> {
        let response = self
            .client
            .post(format!("{}/sandboxes/{}/stop", self.base_url, sandbox_id))
            .json(&serde_json::json!({ "grace_seconds": grace.as_secs() }))
            .timeout(grace + Duration::from_secs(5))
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(sandbox_id, status, body))
    }

    async fn force_terminate(&self, sandbox_id: &str) -> Result<(), ProvisionError> {
        let response = self
            .client
            .delete(format!("{}/sandboxes/{}", self.base_url, sandbox_id))
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(sandbox_id, status, body))
    }
}

/// Provisioner for deployments where workers are launched out of band.
///
/// The session id doubles as the sandbox id and termination is a no-op;
/// the worker stops on its own once its session is terminal.
#[derive(Debug, Default)]
pub struct ExternalProvisioner;

#[async_trait]
impl Provisioner for ExternalProvisioner {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, ProvisionError> {
        tracing::info!(
            session_id = %spec.session_id,
            task_id = %spec.task_id,
            "Awaiting externally launched worker"
        );
        Ok(format!("external-{}", spec.session_id))
    }

    async fn terminate(&self, sandbox_id: &str, _grace: Duration) -> Result<(), ProvisionError> {
        tracing::debug!(sandbox_id, "External sandbox stop requested");
        Ok(())
    }

    async fn force_terminate(&self, sandbox_id: &str) -> Result<(), ProvisionError> {
        tracing::debug!(sandbox_id, "External sandbox kill requested");
        Ok(())
    }
}

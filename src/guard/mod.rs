//! Boundary checks applied before a request reaches any component:
//! authentication, per-session rate limits and body validation.

pub mod auth;
pub mod rate_limit;

use async_trait::async_trait;
use axum::extract::{FromRequest, Request};
use axum::Json;
use serde::de::DeserializeOwned;

pub use auth::{Authenticator, MintedSessionToken, Principal};
pub use rate_limit::{EndpointClass, RateLimiter};

use crate::error::ControlError;
use crate::session::{SandboxSession, SessionObserver, SessionState, Transition};

/// JSON body extractor that reports malformed or oversized bodies as
/// validation errors in the control plane's error format.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ControlError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ControlError::Validation(rejection.body_text())),
        }
    }
}

#[async_trait]
impl SessionObserver for RateLimiter {
    async fn on_transition(
        &self,
        session: &SandboxSession,
        _from: SessionState,
        _transition: &Transition,
    ) {
        if session.is_terminal() {
            self.forget(&session.session_id);
        }
    }
}

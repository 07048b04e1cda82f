//! Session bearer tokens and operator authentication.
//!
//! Workers receive an HS256 token whose `sub` is their session id; every
//! worker endpoint checks that the path's session id matches it. Operator
//! endpoints accept a static bearer token instead.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::ControlError;

const ISSUER: &str = "sandbox-control";

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Session id.
    pub sub: String,
    pub task_id: String,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MintedSessionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Operator,
    Session { session_id: String },
}

impl Principal {
    pub fn require_operator(&self) -> Result<(), ControlError> {
        match self {
            Self::Operator => Ok(()),
            Self::Session { .. } => Err(ControlError::Unauthorized(
                "operator credentials required".to_string(),
            )),
        }
    }

    /// Operators may act on any session; workers only on their own.
    pub fn authorize_session(&self, session_id: &str) -> Result<(), ControlError> {
        match self {
            Self::Operator => Ok(()),
            Self::Session { session_id: own } if own == session_id => Ok(()),
            Self::Session { .. } => Err(ControlError::Unauthorized(format!(
                "token does not grant access to session {session_id}"
            ))),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Operator => None,
            Self::Session { session_id } => Some(session_id),
        }
    }
}

#[derive(Clone)]
pub struct Authenticator {
    secret: String,
    operator_token: Option<String>,
    ttl: Duration,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            secret: config.token_secret().to_string(),
            operator_token: config.operator_token.clone(),
            ttl: Duration::hours(config.session_token_ttl_hours.max(1)),
        }
    }

    /// Whether operator endpoints are open (dev mode without a token).
    pub fn operator_open(&self) -> bool {
        self.operator_token.is_none()
    }

    pub fn mint(&self, session_id: &str, task_id: &str) -> Result<MintedSessionToken, ControlError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = SessionClaims {
            sub: session_id.to_string(),
            task_id: task_id.to_string(),
            exp: timestamp(expires_at)?,
            iat: timestamp(now)?,
            iss: ISSUER.to_string(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ControlError::UpstreamUnavailable(format!("token minting failed: {e}")))?;
        Ok(MintedSessionToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, ControlError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        let data = jsonwebtoken::decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| ControlError::Unauthorized(format!("invalid session token: {e}")))?;
        Ok(data.claims)
    }

    /// Resolve an `Authorization` header value to a principal.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, ControlError> {
        let token = match authorization {
            Some(value) => value
                .strip_prefix("Bearer ")
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ControlError::Unauthorized("expected a bearer token".into()))?,
            None if self.operator_open() => return Ok(Principal::Operator),
            None => return Err(ControlError::Unauthorized("missing bearer token".into())),
        };

        if let Some(expected) = &self.operator_token {
            if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
                return Ok(Principal::Operator);
            }
        }
        let claims = self.verify(token)?;
        Ok(Principal::Session {
            session_id: claims.sub,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> Result<usize, ControlError> {
    usize::try_from(at.timestamp())
        .map_err(|_| ControlError::validation("timestamp out of range"))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

//! Configuration management for the sandbox control plane.
//!
//! Configuration is read from environment variables:
//! - `HOST` / `PORT` - Optional. Listen address. Defaults to `127.0.0.1:3100`.
//! - `DEV_MODE` - Optional. Disables the secret requirements below.
//! - `SESSION_TOKEN_SECRET` - Required outside dev mode. HMAC secret for session bearer tokens.
//! - `OPERATOR_TOKEN` - Required outside dev mode. Static bearer token for operator endpoints.
//! - `CONTROL_STORE_TYPE` - Optional. `sqlite` (default) or `memory`.
//! - `CONTROL_DB_PATH` - Optional. SQLite database path. Defaults to `./.sandbox-control/control.db`.
//! - `PROVISIONER_URL` - Optional. Base URL of the sandbox provisioning API. Without it,
//!   workers are expected to be launched out of band.
//! - `DIRECT_DELIVERY_URL` - Optional. Webhook for interventions to tasks with no sandbox.
//!
//! Tuning knobs for ingestion, queueing, the heartbeat supervisor, rate limits
//! and retention are documented on their respective structs.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which backend holds sessions and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Memory,
    Sqlite,
}

impl StoreType {
    pub fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "memory" | "in_memory" | "in-memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::InvalidValue(
                "CONTROL_STORE_TYPE".to_string(),
                format!("unknown store type: {}", other),
            )),
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub store_type: StoreType,
    pub db_path: PathBuf,
    /// Per-call timeout for store operations
    pub call_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Sqlite,
            db_path: PathBuf::from(".sandbox-control").join("control.db"),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Session and operator authentication.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for signing/verifying session bearer tokens.
    pub session_token_secret: Option<String>,

    /// Static bearer token accepted on operator endpoints.
    pub operator_token: Option<String>,

    /// Session token validity in hours.
    pub session_token_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_token_secret: None,
            operator_token: None,
            session_token_ttl_hours: 24,
        }
    }
}

impl AuthConfig {
    /// Secret used for session tokens. Dev mode falls back to a fixed value.
    pub fn token_secret(&self) -> &str {
        self.session_token_secret
            .as_deref()
            .unwrap_or("sandbox-control-dev-secret")
    }
}

/// Event ingestion tuning.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Serialized `event_data` ceiling in bytes (`EVENT_MAX_PAYLOAD_BYTES`)
    pub max_payload_bytes: usize,
    /// Largest diff kept inline in a broadcast (`EVENT_PREVIEW_BYTES`)
    pub preview_bytes: usize,
    /// Tier-2 flush period (`TIER2_FLUSH_MS`)
    pub tier2_flush_interval: Duration,
    /// Tier-2 buffer size that forces an early flush (`TIER2_BATCH_CAP`)
    pub tier2_batch_cap: usize,
    /// Attempts per store/bus call before giving up
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 64 * 1024,
            preview_bytes: 4 * 1024,
            tier2_flush_interval: Duration::from_millis(500),
            tier2_batch_cap: 50,
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

/// Message queue limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum message content size in bytes (`MESSAGE_MAX_BYTES`)
    pub max_content_bytes: usize,
    /// Maximum pending messages per session
    pub max_pending: usize,
    /// Hook-mode refill period, in worker actions
    pub hook_refill_every: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 16 * 1024,
            max_pending: 256,
            hook_refill_every: 5,
        }
    }
}

/// Heartbeat supervisor and restart tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tick_interval: Duration,
    /// Liveness TTL while the worker reports it is running
    pub running_ttl: Duration,
    /// Liveness TTL while the worker reports it is idle or waiting
    pub idle_ttl: Duration,
    /// Missed TTL intervals before a session is declared unresponsive
    pub missed_threshold: u32,
    /// Maximum time a session may spend in CREATING
    pub creation_timeout: Duration,
    /// Idle sessions with no work are terminated after this long
    pub idle_reap_after: Duration,
    pub graceful_stop_timeout: Duration,
    /// Timeout for a single provisioner call
    pub provision_timeout: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            running_ttl: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(120),
            missed_threshold: 3,
            creation_timeout: Duration::from_secs(120),
            idle_reap_after: Duration::from_secs(600),
            graceful_stop_timeout: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(60),
            max_restarts: 3,
            restart_window: Duration::from_secs(3600),
        }
    }
}

/// Per-session sliding-window rate limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window: Duration,
    pub events_per_window: u32,
    pub heartbeats_per_window: u32,
    pub polls_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            events_per_window: 600,
            heartbeats_per_window: 30,
            polls_per_window: 120,
        }
    }
}

/// Hot/warm/cold event retention.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Events younger than this keep their artifacts
    pub hot: chrono::Duration,
    /// Tier-2 events older than this are deleted
    pub warm: chrono::Duration,
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hot: chrono::Duration::hours(24),
            warm: chrono::Duration::hours(168),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Development mode (relaxed secrets)
    pub dev_mode: bool,

    /// Provisioning API base URL
    pub provisioner_url: Option<String>,

    /// Legacy intervention webhook for tasks that never ran in a sandbox
    pub direct_delivery_url: Option<String>,

    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub rate_limit: RateLimitConfig,
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if auth secrets are missing outside
    /// dev mode, and `ConfigError::InvalidValue` for unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3100u16)?;

        let dev_mode = std::env::var("DEV_MODE")
            .ok()
            .map(|v| parse_bool(&v).map_err(|e| ConfigError::InvalidValue("DEV_MODE".to_string(), e)))
            .transpose()?
            .unwrap_or(cfg!(debug_assertions));

        let auth = AuthConfig {
            session_token_secret: std::env::var("SESSION_TOKEN_SECRET").ok(),
            operator_token: std::env::var("OPERATOR_TOKEN").ok(),
            session_token_ttl_hours: env_parse("SESSION_TOKEN_TTL_HOURS", 24i64)?,
        };

        if !dev_mode {
            if auth.session_token_secret.is_none() {
                return Err(ConfigError::MissingEnvVar("SESSION_TOKEN_SECRET".to_string()));
            }
            if auth.operator_token.is_none() {
                return Err(ConfigError::MissingEnvVar("OPERATOR_TOKEN".to_string()));
            }
        }

        let store_defaults = StoreConfig::default();
        let store = StoreConfig {
            store_type: std::env::var("CONTROL_STORE_TYPE")
                .ok()
                .map(|v| StoreType::from_str(&v))
                .transpose()?
                .unwrap_or(store_defaults.store_type),
            db_path: std::env::var("CONTROL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(store_defaults.db_path),
            call_timeout: Duration::from_secs(env_parse("STORE_TIMEOUT_SECS", 5u64)?),
        };

        let ingest_defaults = IngestConfig::default();
        let ingest = IngestConfig {
            max_payload_bytes: env_parse("EVENT_MAX_PAYLOAD_BYTES", ingest_defaults.max_payload_bytes)?,
            preview_bytes: env_parse("EVENT_PREVIEW_BYTES", ingest_defaults.preview_bytes)?,
            tier2_flush_interval: Duration::from_millis(env_parse("TIER2_FLUSH_MS", 500u64)?),
            tier2_batch_cap: env_parse("TIER2_BATCH_CAP", ingest_defaults.tier2_batch_cap)?.max(1),
            ..ingest_defaults
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            max_content_bytes: env_parse("MESSAGE_MAX_BYTES", queue_defaults.max_content_bytes)?,
            max_pending: env_parse("MESSAGE_MAX_PENDING", queue_defaults.max_pending)?,
            hook_refill_every: env_parse("HOOK_REFILL_EVERY", queue_defaults.hook_refill_every)?
                .max(1),
        };

        let supervisor = SupervisorConfig {
            tick_interval: Duration::from_secs(env_parse("HEARTBEAT_TICK_SECS", 5u64)?.max(1)),
            running_ttl: Duration::from_secs(env_parse("RUNNING_TTL_SECS", 60u64)?),
            idle_ttl: Duration::from_secs(env_parse("IDLE_TTL_SECS", 120u64)?),
            missed_threshold: env_parse("MISSED_INTERVAL_THRESHOLD", 3u32)?.max(1),
            creation_timeout: Duration::from_secs(env_parse("CREATION_TIMEOUT_SECS", 120u64)?),
            idle_reap_after: Duration::from_secs(env_parse("IDLE_REAP_SECS", 600u64)?),
            graceful_stop_timeout: Duration::from_secs(env_parse("GRACEFUL_STOP_SECS", 10u64)?),
            provision_timeout: Duration::from_secs(env_parse("PROVISION_TIMEOUT_SECS", 60u64)?),
            max_restarts: env_parse("MAX_RESTARTS", 3u32)?,
            restart_window: Duration::from_secs(env_parse("RESTART_WINDOW_SECS", 3600u64)?),
        };

        let rate_limit = RateLimitConfig {
            enabled: std::env::var("RATE_LIMIT_ENABLED")
                .ok()
                .map(|v| {
                    parse_bool(&v)
                        .map_err(|e| ConfigError::InvalidValue("RATE_LIMIT_ENABLED".to_string(), e))
                })
                .transpose()?
                .unwrap_or(true),
            window: Duration::from_secs(env_parse("RATE_WINDOW_SECS", 60u64)?.max(1)),
            events_per_window: env_parse("RATE_EVENTS", 600u32)?,
            heartbeats_per_window: env_parse("RATE_HEARTBEATS", 30u32)?,
            polls_per_window: env_parse("RATE_POLLS", 120u32)?,
        };

        let retention = RetentionConfig {
            hot: chrono::Duration::hours(env_parse("HOT_RETENTION_HOURS", 24i64)?),
            warm: chrono::Duration::hours(env_parse("WARM_RETENTION_HOURS", 168i64)?),
            ..RetentionConfig::default()
        };

        Ok(Self {
            host,
            port,
            dev_mode,
            provisioner_url: std::env::var("PROVISIONER_URL").ok(),
            direct_delivery_url: std::env::var("DIRECT_DELIVERY_URL").ok(),
            auth,
            store,
            ingest,
            queue,
            supervisor,
            rate_limit,
            retention,
        })
    }

    /// In-memory, dev-mode configuration (useful for testing).
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            dev_mode: true,
            provisioner_url: None,
            direct_delivery_url: None,
            auth: AuthConfig {
                session_token_secret: Some("test-secret".to_string()),
                operator_token: Some("operator-token".to_string()),
                session_token_ttl_hours: 1,
            },
            store: StoreConfig {
                store_type: StoreType::Memory,
                ..StoreConfig::default()
            },
            ingest: IngestConfig::default(),
            queue: QueueConfig::default(),
            supervisor: SupervisorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("YES"), Ok(true));
        assert_eq!(parse_bool(" off "), Ok(false));
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn store_type_rejects_unknown_backends() {
        assert_eq!(StoreType::from_str("Memory").unwrap(), StoreType::Memory);
        assert_eq!(StoreType::from_str("sqlite").unwrap(), StoreType::Sqlite);
        assert!(matches!(
            StoreType::from_str("redis"),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }

    #[test]
    fn test_config_is_in_memory_dev_mode() {
        let config = Config::for_tests();
        assert!(config.dev_mode);
        assert_eq!(config.store.store_type, StoreType::Memory);
        assert_eq!(config.ingest.tier2_flush_interval, Duration::from_millis(500));
        assert_eq!(config.auth.token_secret(), "test-secret");
    }
}

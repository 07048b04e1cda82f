//! # Sandbox Control
//!
//! Control plane for short-lived, isolated sandbox worker sessions.
//!
//! This library provides:
//! - A session registry with an explicit lifecycle state machine
//! - An event ingestion pipeline with tiered (immediate vs. batched) fan-out
//! - Per-session priority message queues for operator and guardian input
//! - A heartbeat supervisor that escalates silence into restarts
//! - An HTTP API guarded by session tokens and per-session rate limits
//!
//! ## Architecture
//!
//! Every inbound worker request passes through the guard, then reaches the
//! ingestion pipeline or the message queue. Both read and update the
//! registry; accepted events are persisted, then published on the bus. The
//! supervisor watches the same events to judge liveness and, on failure,
//! asks the provisioner to replace the sandbox.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sandbox_control::{api, config::Config};
//!
//! let config = Config::from_env()?;
//! api::serve(config).await?;
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod hook;
pub mod ingest;
pub mod intervention;
pub mod provisioner;
pub mod queue;
pub mod retry;
pub mod session;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use error::ControlError;

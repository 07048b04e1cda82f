//! HTTP API: worker-facing session endpoints, operator endpoints and SSE
//! streams.

mod operator;
pub mod routes;
mod sessions;
mod stream;
pub mod types;

pub use routes::{router, serve, AppState, Collaborators};

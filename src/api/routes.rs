//! HTTP route definitions, shared state and server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::types::HealthResponse;
use super::{operator, sessions, stream};
use crate::bus::{BroadcastBus, EventBus};
use crate::config::Config;
use crate::guard::{Authenticator, RateLimiter};
use crate::hook::InterventionSource;
use crate::ingest::IngestPipeline;
use crate::intervention::{DirectDelivery, InterventionRouter, NoDirectDelivery, WebhookDirectDelivery};
use crate::provisioner::{ExternalProvisioner, HttpProvisioner, Provisioner};
use crate::queue::MessageQueue;
use crate::session::SessionRegistry;
use crate::store::{create_control_store, ControlStore};
use crate::supervisor::{spawn_retention_sweep, HeartbeatSupervisor, LivenessTracker};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ControlStore>,
    pub registry: Arc<SessionRegistry>,
    pub bus: Arc<dyn EventBus>,
    pub pipeline: Arc<IngestPipeline>,
    pub queue: Arc<MessageQueue>,
    pub router: Arc<InterventionRouter>,
    pub supervisor: Arc<HeartbeatSupervisor>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<Authenticator>,
    pub shutdown: CancellationToken,
}

/// Collaborators that live outside the control plane.
pub struct Collaborators {
    pub store: Arc<dyn ControlStore>,
    pub bus: Arc<dyn EventBus>,
    pub provisioner: Arc<dyn Provisioner>,
    pub direct: Arc<dyn DirectDelivery>,
}

impl Collaborators {
    /// Build the collaborators named by the configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = create_control_store(&config.store)?;
        let provisioner: Arc<dyn Provisioner> = match &config.provisioner_url {
            Some(url) => {
                tracing::info!(url = %url, "Using HTTP provisioner");
                Arc::new(HttpProvisioner::new(url, config.supervisor.provision_timeout)?)
            }
            None => {
                tracing::info!("No PROVISIONER_URL; expecting externally launched workers");
                Arc::new(ExternalProvisioner)
            }
        };
        let direct: Arc<dyn DirectDelivery> = match &config.direct_delivery_url {
            Some(url) => Arc::new(WebhookDirectDelivery::new(
                url,
                config.supervisor.provision_timeout,
            )?),
            None => Arc::new(NoDirectDelivery),
        };
        Ok(Self {
            store,
            bus: Arc::new(BroadcastBus::default()),
            provisioner,
            direct,
        })
    }
}

impl AppState {
    /// Wire every component together and register lifecycle observers.
    ///
    /// Background loops are not started here; see [`AppState::start_background`].
    pub fn build(config: Config, collaborators: Collaborators) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let Collaborators {
            store,
            bus,
            provisioner,
            direct,
        } = collaborators;

        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&store),
            config.store.call_timeout,
        ));
        let liveness = Arc::new(LivenessTracker::new());
        let auth = Arc::new(Authenticator::new(&config.auth));
        let pipeline = Arc::new(IngestPipeline::new(
            config.ingest.clone(),
            config.store.call_timeout,
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&liveness),
            shutdown.clone(),
        ));
        let queue = Arc::new(MessageQueue::new(
            config.queue.clone(),
            Arc::clone(&registry),
            Arc::clone(&pipeline),
        ));
        let router = Arc::new(InterventionRouter::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            direct,
        ));
        let supervisor = Arc::new(HeartbeatSupervisor::new(
            config.supervisor.clone(),
            Arc::clone(&registry),
            liveness,
            provisioner,
            Arc::clone(&pipeline),
            Arc::clone(&auth),
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        // Order matters: the state-change event is recorded before the
        // pipeline closes the lane, and before other resources go away.
        registry.add_observer(Arc::clone(&pipeline) as _);
        registry.add_observer(Arc::clone(&queue) as _);
        registry.add_observer(Arc::clone(&limiter) as _);
        registry.add_observer(Arc::clone(&supervisor) as _);

        Arc::new(Self {
            config,
            store,
            registry,
            bus,
            pipeline,
            queue,
            router,
            supervisor,
            limiter,
            auth,
            shutdown,
        })
    }

    /// Recover persisted sessions and start the supervisor and retention loops.
    pub async fn start_background(self: &Arc<Self>) {
        if self.store.is_persistent() {
            if let Err(err) = self.supervisor.recover().await {
                tracing::warn!(error = %err, "Startup recovery failed");
            }
        }
        self.supervisor.spawn(self.shutdown.clone());
        spawn_retention_sweep(
            Arc::clone(&self.store),
            self.config.retention.clone(),
            self.shutdown.clone(),
        );
    }

    /// Local intervention source for in-process hook queues.
    pub fn intervention_source(&self) -> Arc<dyn InterventionSource> {
        Arc::clone(&self.queue) as _
    }
}

/// Build the router for the given state.
pub fn router(state: Arc<AppState>) -> Router {
    let auth_layer = middleware::from_fn_with_state(Arc::clone(&state), auth_middleware);
    // Request bodies are capped well above the payload ceiling so that
    // oversize payloads reach validation and get a precise error.
    let body_limit = state
        .config
        .ingest
        .max_payload_bytes
        .max(state.config.queue.max_content_bytes)
        .saturating_mul(4)
        .max(1024 * 1024);

    let api = Router::new()
        .route("/sessions/heartbeat", post(sessions::heartbeat))
        .route(
            "/sessions",
            post(operator::create_session).get(operator::list_sessions),
        )
        .route("/sessions/:id", get(operator::get_session))
        .route(
            "/sessions/:id/events",
            post(sessions::post_event).get(sessions::list_events),
        )
        .route(
            "/sessions/:id/messages",
            post(sessions::post_message).get(sessions::poll_messages),
        )
        .route(
            "/sessions/:id/interventions",
            post(sessions::post_intervention).get(sessions::poll_interventions),
        )
        .route("/sessions/:id/stream", get(stream::session_stream))
        .route("/sessions/:id/complete", post(operator::complete_session))
        .route("/sessions/:id/finalize", post(operator::finalize_session))
        .route("/sessions/:id/recovery", post(operator::update_recovery))
        .route("/sessions/:id/cancel", post(operator::cancel_session))
        .route("/sessions/:id/commands", post(operator::send_command))
        .route("/tasks/:task_id/interventions", post(operator::route_intervention))
        .route("/events/:event_id/artifact", get(sessions::get_artifact))
        .route("/stream", get(stream::monitor_stream))
        .layer(auth_layer);

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the bearer token to a [`crate::guard::Principal`] and attach it
/// to the request.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match state.auth.authenticate(header_value) {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(path = %req.uri().path(), error = %err, "Request rejected");
            err.into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store_persistent: state.store.is_persistent(),
        open_lanes: state.pipeline.open_lanes(),
        tracked_sessions: state.supervisor.liveness().len(),
    })
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let collaborators = Collaborators::from_config(&config)?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = AppState::build(config, collaborators);
    state.start_background().await;

    let app = router(Arc::clone(&state));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // Flush buffered Tier-2 batches before exit.
    state.pipeline.flush_all().await;
    state.supervisor.settle().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "Failed to listen for shutdown signal"),
    }
    shutdown.cancel();
}

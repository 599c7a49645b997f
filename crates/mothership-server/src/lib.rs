//! `mothership-server` – HTTP + WebSocket front door
//!
//! Exposes the orchestration core over a JSON REST API and two WebSocket
//! endpoints:
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /health`, `GET /ready` | Liveness and store readiness |
//! | `GET /metrics` | Prometheus text exposition |
//! | `/api/agents…` | Register, heartbeat, status, deregister, list |
//! | `/api/tasks…` | Submit, create, start, cancel, inspect |
//! | `/api/directives…` | Generate and fetch directives |
//! | `/api/schema/constraints` | JSON Schema of the constraint envelope |
//! | `/api/ontology…` | Values, Beliefs, summary |
//! | `GET /ws/agents/{id}` | Agent lane (assignments in, reports out) |
//! | `GET /ws/observers` | Live event stream |
//!
//! Errors are returned as `{"error": <kind>, "detail": <message>}`; see
//! [`error`] for the status mapping.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mothership_runtime::HashingEmbedder;
//! use mothership_server::{AppState, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::open(None, ServiceConfig::default(), Arc::new(HashingEmbedder::default()))?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     mothership_server::serve(listener, state, std::future::pending()).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod error;
pub mod metrics;
pub mod state;
pub mod ws;

use std::future::Future;

use axum::Router;
use axum::middleware;
use axum::routing::{get, patch, post, put};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use error::ApiError;
pub use state::{AppState, ServiceConfig};

/// Default TCP port for the API server.
pub const DEFAULT_PORT: u16 = 8080;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/ready", get(api::ready))
        .route("/metrics", get(metrics::metrics_handler))
        // Agents
        .route("/api/agents", get(api::list_agents).post(api::register_agent))
        .route(
            "/api/agents/{id}",
            get(api::get_agent).delete(api::deregister_agent),
        )
        .route("/api/agents/{id}/heartbeat", post(api::agent_heartbeat))
        .route("/api/agents/{id}/status", put(api::set_agent_status))
        // Tasks
        .route("/api/tasks", post(api::create_task))
        .route("/api/tasks/submit", post(api::submit_task))
        .route("/api/tasks/recent", get(api::recent_tasks))
        .route("/api/tasks/{id}", get(api::get_task))
        .route("/api/tasks/{id}/start", post(api::start_task))
        .route("/api/tasks/{id}/cancel", post(api::cancel_task))
        // Directives
        .route("/api/directives", post(api::generate_directive))
        .route("/api/directives/{id}", get(api::get_directive))
        .route("/api/schema/constraints", get(api::constraint_schema))
        // Ontology
        .route(
            "/api/ontology/values",
            get(api::list_values).post(api::add_value),
        )
        .route(
            "/api/ontology/values/{id}",
            patch(api::edit_value).delete(api::delete_value),
        )
        .route(
            "/api/ontology/beliefs",
            get(api::list_beliefs).post(api::add_belief),
        )
        .route(
            "/api/ontology/beliefs/{id}",
            patch(api::edit_belief).delete(api::delete_belief),
        )
        .route("/api/ontology/summary", get(api::ontology_summary))
        // Realtime
        .route("/ws/agents/{id}", get(ws::agent_upgrade))
        .route("/ws/observers", get(ws::observer_upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics::track_requests,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mothership api listening");
    }
    let recorder = metrics::spawn_task_recorder(state.clone());
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    recorder.abort();
    served
}

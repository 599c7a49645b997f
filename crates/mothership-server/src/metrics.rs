//! Prometheus metrics, served at `GET /metrics`.
//!
//! Every [`AppState`] owns its own [`Registry`], so two services in one
//! process never share counters.
//!
//! | Metric | Type | Labels |
//! |---|---|---|
//! | `mothership_requests_total` | counter | method, path, status |
//! | `mothership_request_duration_seconds` | histogram | method, path |
//! | `mothership_agents` | gauge | status |
//! | `mothership_agent_heartbeats_total` | counter | – |
//! | `mothership_tasks_total` | counter | status (one per transition) |
//! | `mothership_task_duration_seconds` | histogram | status |
//! | `mothership_ontology_size` | gauge | kind (`value`, `belief`) |
//! | `mothership_websocket_connections` | gauge | endpoint |
//! | `mothership_websocket_messages_total` | counter | direction |
//!
//! Task counters follow the observers topic; agent and ontology gauges are
//! refreshed on every scrape.

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use mothership_types::{AgentStatus, EventPayload, MothershipError, TaskStatus};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::state::AppState;

/// Request latency buckets (seconds).
const REQUEST_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5];

/// Task run-time buckets (seconds).
const TASK_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    agents: GaugeVec,
    agent_heartbeats_total: IntCounter,
    tasks_total: IntCounterVec,
    task_duration_seconds: HistogramVec,
    ontology_size: GaugeVec,
    websocket_connections: GaugeVec,
    websocket_messages_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("mothership_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("mothership_request_duration_seconds", "HTTP request duration in seconds")
                .buckets(REQUEST_LATENCY_BUCKETS.to_vec()),
            &["method", "path"],
        )?;
        let agents = GaugeVec::new(
            Opts::new("mothership_agents", "Registered agents by status"),
            &["status"],
        )?;
        let agent_heartbeats_total =
            IntCounter::new("mothership_agent_heartbeats_total", "Total agent heartbeats")?;
        let tasks_total = IntCounterVec::new(
            Opts::new("mothership_tasks_total", "Task transitions by resulting status"),
            &["status"],
        )?;
        let task_duration_seconds = HistogramVec::new(
            HistogramOpts::new("mothership_task_duration_seconds", "Time from start to a terminal status")
                .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["status"],
        )?;
        let ontology_size = GaugeVec::new(
            Opts::new("mothership_ontology_size", "Stored ontology entries"),
            &["kind"],
        )?;
        let websocket_connections = GaugeVec::new(
            Opts::new("mothership_websocket_connections", "Open WebSocket connections"),
            &["endpoint"],
        )?;
        let websocket_messages_total = IntCounterVec::new(
            Opts::new("mothership_websocket_messages_total", "WebSocket frames exchanged"),
            &["direction"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(agents.clone()))?;
        registry.register(Box::new(agent_heartbeats_total.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration_seconds.clone()))?;
        registry.register(Box::new(ontology_size.clone()))?;
        registry.register(Box::new(websocket_connections.clone()))?;
        registry.register(Box::new(websocket_messages_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            agents,
            agent_heartbeats_total,
            tasks_total,
            task_duration_seconds,
            ontology_size,
            websocket_connections,
            websocket_messages_total,
        })
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, path, status.as_str()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn heartbeat(&self) {
        self.agent_heartbeats_total.inc();
    }

    pub fn task_transition(&self, status: TaskStatus, run_secs: Option<f64>) {
        let status = status.as_str();
        self.tasks_total.with_label_values(&[status]).inc();
        if let Some(secs) = run_secs {
            self.task_duration_seconds
                .with_label_values(&[status])
                .observe(secs);
        }
    }

    pub fn ws_connected(&self, endpoint: &str) {
        self.websocket_connections.with_label_values(&[endpoint]).inc();
    }

    pub fn ws_disconnected(&self, endpoint: &str) {
        self.websocket_connections.with_label_values(&[endpoint]).dec();
    }

    pub fn ws_message(&self, direction: &str) {
        self.websocket_messages_total
            .with_label_values(&[direction])
            .inc();
    }

    /// Recompute the gauges that mirror stored state.
    fn refresh(&self, state: &AppState) -> Result<(), MothershipError> {
        let agents = state.registry.list(None);
        for status in [
            AgentStatus::Active,
            AgentStatus::Inactive,
            AgentStatus::Maintenance,
            AgentStatus::Error,
        ] {
            let count = agents.iter().filter(|a| a.status == status).count();
            self.agents
                .with_label_values(&[status.as_str()])
                .set(count as f64);
        }

        let summary = state.knowledge().summary()?;
        self.ontology_size
            .with_label_values(&["value"])
            .set(summary.total_values as f64);
        self.ontology_size
            .with_label_values(&["belief"])
            .set(summary.total_beliefs as f64);
        Ok(())
    }

    /// Text exposition of every metric in this registry.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    if let Err(e) = state.metrics.refresh(&state) {
        error!(error = %e, "failed to refresh metrics gauges");
    }
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

/// Request counter and latency for every routed request.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(req).await;
    state.metrics.record_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Count task transitions from the observers topic until the bus goes away.
pub fn spawn_task_recorder(state: AppState) -> JoinHandle<()> {
    let mut events = state.bus.subscribe_observers();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let EventPayload::TaskStatus { task_id, status, .. } = event.payload else {
                continue;
            };
            let run_secs = if status.is_terminal() {
                state.orchestrator.get(task_id).await.ok().and_then(|task| {
                    let started = task.started_at?;
                    let ended = task.completed_at?;
                    Some((ended - started).num_milliseconds().max(0) as f64 / 1000.0)
                })
            } else {
                None
            };
            state.metrics.task_transition(status, run_secs);
        }
        debug!("task metrics recorder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() -> Result<(), prometheus::Error> {
        let a = Metrics::new()?;
        let b = Metrics::new()?;
        a.heartbeat();
        a.heartbeat();
        assert!(a.render()?.contains("mothership_agent_heartbeats_total 2"));
        assert!(b.render()?.contains("mothership_agent_heartbeats_total 0"));
        Ok(())
    }

    #[test]
    fn task_transitions_are_labelled_by_status() -> Result<(), prometheus::Error> {
        let metrics = Metrics::new()?;
        metrics.task_transition(TaskStatus::Pending, None);
        metrics.task_transition(TaskStatus::Completed, Some(1.5));
        let text = metrics.render()?;
        assert!(text.contains(r#"mothership_tasks_total{status="pending"} 1"#));
        assert!(text.contains(r#"mothership_tasks_total{status="completed"} 1"#));
        assert!(text.contains(r#"mothership_task_duration_seconds_count{status="completed"} 1"#));
        Ok(())
    }

    #[test]
    fn websocket_gauge_tracks_open_sessions() -> Result<(), prometheus::Error> {
        let metrics = Metrics::new()?;
        metrics.ws_connected("agents");
        metrics.ws_connected("agents");
        metrics.ws_disconnected("agents");
        metrics.ws_message("inbound");
        let text = metrics.render()?;
        assert!(text.contains(r#"mothership_websocket_connections{endpoint="agents"} 1"#));
        assert!(text.contains(r#"mothership_websocket_messages_total{direction="inbound"} 1"#));
        Ok(())
    }
}

//! WebSocket endpoints.
//!
//! * `/ws/agents/{id}`: one bidirectional lane per registered agent. The
//!   server greets with `welcome`, replays pending assignments, forwards
//!   every new assignment and checks liveness with `heartbeat`. Agent frames
//!   are throttled per connection; unparseable or rejected frames are answered
//!   with `error` and the connection stays open.
//! * `/ws/observers`: read-only stream of [`Event`]s.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use mothership_middleware::{AgentMessage, InboundThrottle, ServerMessage};
use mothership_types::{AgentId, Event};
use tracing::{debug, info, warn};

use crate::api::announce_agent;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::state::AppState;

const AGENTS_ENDPOINT: &str = "agents";
const OBSERVERS_ENDPOINT: &str = "observers";

// ── Agent lane ─────────────────────────────────────────────────────────

/// Rejects unknown agents with 404 before the upgrade.
pub async fn agent_upgrade(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<AgentId>,
    State(state): State<AppState>,
) -> Response {
    if let Err(e) = state.registry.get(agent_id) {
        return ApiError(e).into_response();
    }
    ws.on_upgrade(move |socket| agent_session(socket, state, agent_id))
}

async fn agent_session(socket: WebSocket, state: AppState, agent_id: AgentId) {
    state.metrics.ws_connected(AGENTS_ENDPOINT);
    info!(%agent_id, "agent connected");
    run_agent_lane(socket, &state, agent_id).await;
    state.metrics.ws_disconnected(AGENTS_ENDPOINT);
    info!(%agent_id, "agent disconnected");
}

async fn run_agent_lane(socket: WebSocket, state: &AppState, agent_id: AgentId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let metrics = &state.metrics;
    let mut lane = match state.orchestrator.attach_agent(agent_id).await {
        Ok(lane) => lane,
        Err(e) => {
            warn!(%agent_id, error = %e, "pending assignments not replayed");
            state.bus.subscribe_agent(agent_id)
        }
    };

    if let Ok(agent) = state.registry.heartbeat(agent_id, Utc::now()) {
        metrics.heartbeat();
        announce_agent(state, &agent);
    }
    let welcome = ServerMessage::Welcome {
        agent_id,
        heartbeat_interval_secs: state.heartbeat_interval.as_secs().max(1),
    };
    if send(&mut ws_tx, &welcome, metrics).await.is_err() {
        return;
    }

    let throttle = InboundThrottle::default();
    let period = if state.heartbeat_interval.is_zero() {
        Duration::from_secs(1)
    } else {
        state.heartbeat_interval
    };
    let mut ping = tokio::time::interval(period);
    ping.tick().await;

    loop {
        tokio::select! {
            // ── Downstream: bus → agent ────────────────────────────────
            outbound = lane.recv() => {
                let Some(msg) = outbound else {
                    // Lane removed: the agent was deregistered.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                if send(&mut ws_tx, &msg, metrics).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                let ping = ServerMessage::Heartbeat { timestamp: Utc::now() };
                if send(&mut ws_tx, &ping, metrics).await.is_err() {
                    break;
                }
            }
            // ── Upstream: agent → orchestrator ─────────────────────────
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        metrics.ws_message("inbound");
                        let reply = if throttle.allow() {
                            handle_agent_frame(state, agent_id, text.as_str()).await
                        } else {
                            warn!(%agent_id, "agent frame throttled");
                            Some(ServerMessage::Error { message: "rate limited".into() })
                        };
                        if let Some(reply) = reply {
                            if send(&mut ws_tx, &reply, metrics).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%agent_id, error = %e, "agent socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Apply one agent frame. Returns the reply to send, if any.
pub(crate) async fn handle_agent_frame(
    state: &AppState,
    agent_id: AgentId,
    raw: &str,
) -> Option<ServerMessage> {
    let msg = match AgentMessage::from_json(raw) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%agent_id, error = %e, "unparseable agent frame");
            return Some(ServerMessage::Error {
                message: format!("invalid message: {e}"),
            });
        }
    };

    let outcome = match msg {
        AgentMessage::Heartbeat { timestamp } => {
            let timestamp = timestamp.unwrap_or_else(Utc::now);
            return Some(match state.registry.heartbeat(agent_id, timestamp) {
                Ok(_) => {
                    state.metrics.heartbeat();
                    ServerMessage::HeartbeatAck { timestamp }
                }
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            });
        }
        AgentMessage::TaskRequest(report) => state
            .orchestrator
            .apply_report(agent_id, report)
            .await
            .map(|_| ()),
        AgentMessage::StatusUpdate { status } => state
            .registry
            .set_status(agent_id, status)
            .map(|agent| announce_agent(state, &agent)),
    };

    outcome.err().map(|e| ServerMessage::Error {
        message: e.to_string(),
    })
}

async fn send<S>(sink: &mut S, msg: &ServerMessage, metrics: &Metrics) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to encode server frame");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await.map_err(|_| ())?;
    metrics.ws_message("outbound");
    Ok(())
}

// ── Observers ──────────────────────────────────────────────────────────

pub async fn observer_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| observer_session(socket, state))
}

async fn observer_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.bus.subscribe_observers();
    state.metrics.ws_connected(OBSERVERS_ENDPOINT);
    debug!("observer connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if forward_event(&mut ws_tx, &event).await.is_err() {
                    break;
                }
                state.metrics.ws_message("outbound");
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.metrics.ws_disconnected(OBSERVERS_ENDPOINT);
    debug!("observer disconnected");
}

async fn forward_event<S>(sink: &mut S, event: &Event) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json.into())).await.map_err(|_| ()),
        Err(e) => {
            warn!(error = %e, "failed to encode observer event");
            Ok(())
        }
    }
}

//! REST handlers.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use mothership_kernel::NewAgent;
use mothership_runtime::{Actor, CreateTask, KnowledgeEdit, SubmitRequest};
use mothership_types::{
    Agent, AgentId, AgentStatus, Belief, BeliefId, CapabilityMap, ConstraintSet, Directive,
    DirectiveId, Event, EventPayload, Task, TaskId, Value, ValueId,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

const EVENT_SOURCE: &str = "mothership-server::api";
const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

type ApiResult<T> = Result<T, ApiError>;

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime().as_secs(),
    })
}

/// Ready once both stores answer a query.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let stores = state
        .knowledge()
        .summary()
        .map_err(|e| e.to_string())
        .and_then(|_| state.orchestrator.count().map_err(|e| e.to_string()));
    match stores {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "ready": true }))),
        Err(detail) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false, "detail": detail })),
        ),
    }
}

// ── Agents ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AgentFilter {
    agent_type: Option<String>,
}

#[derive(Deserialize)]
pub struct RegisterAgent {
    name: String,
    agent_type: String,
    #[serde(default)]
    capabilities: CapabilityMap,
    #[serde(default)]
    status: Option<AgentStatus>,
}

#[derive(Deserialize)]
pub struct StatusChange {
    status: AgentStatus,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(filter): Query<AgentFilter>,
) -> Json<Vec<Agent>> {
    Json(state.registry.list(filter.agent_type.as_deref()))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.registry.get(id)?))
}

pub async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterAgent>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    let mut new = NewAgent::new(req.name, req.agent_type).with_capabilities(req.capabilities);
    new.status = req.status;
    let agent = state.registry.register(new)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn agent_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    let before = state.registry.get(id)?.status;
    let agent = state.registry.heartbeat(id, Utc::now())?;
    state.metrics.heartbeat();
    if agent.status != before {
        announce_agent(&state, &agent);
    }
    Ok(Json(agent))
}

pub async fn set_agent_status(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(req): Json<StatusChange>,
) -> ApiResult<Json<Agent>> {
    let agent = state.registry.set_status(id, req.status)?;
    announce_agent(&state, &agent);
    Ok(Json(agent))
}

pub async fn deregister_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> ApiResult<Json<Agent>> {
    let agent = state.registry.deregister(id)?;
    state.bus.remove_lane(id);
    Ok(Json(agent))
}

pub(crate) fn announce_agent(state: &AppState, agent: &Agent) {
    state.bus.publish_event(Event::new(
        EVENT_SOURCE,
        EventPayload::AgentStatus {
            agent_id: agent.id,
            status: agent.status,
        },
    ));
}

// ── Tasks ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RecentQuery {
    limit: Option<usize>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.create_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.orchestrator.submit(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn recent_tasks(
    State(state): State<AppState>,
    Query(q): Query<RecentQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    Ok(Json(state.orchestrator.list_recent(limit)?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.get(id).await?))
}

pub async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.orchestrator.mark_in_progress(id, Actor::Admin).await?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    let task = state.orchestrator.cancel(id).await?;
    info!(task_id = %id, "task cancelled via api");
    Ok(Json(task))
}

// ── Directives ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DirectiveRequest {
    task_description: String,
    task_type: String,
    #[serde(default)]
    user_context: Option<String>,
}

impl DirectiveRequest {
    fn context(&self) -> String {
        match self.user_context.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{}\n{extra}", self.task_description),
            _ => self.task_description.clone(),
        }
    }
}

pub async fn generate_directive(
    State(state): State<AppState>,
    Json(req): Json<DirectiveRequest>,
) -> ApiResult<(StatusCode, Json<Directive>)> {
    let directive = state
        .orchestrator
        .generate_directive(&req.task_type, &req.context())
        .await?;
    Ok((StatusCode::CREATED, Json(directive)))
}

pub async fn get_directive(
    State(state): State<AppState>,
    Path(id): Path<DirectiveId>,
) -> ApiResult<Json<Directive>> {
    Ok(Json(state.orchestrator.get_directive(id)?))
}

/// JSON Schema of the constraint envelope agents receive.
pub async fn constraint_schema() -> Json<schemars::schema::RootSchema> {
    Json(schemars::schema_for!(ConstraintSet))
}

// ── Ontology ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct Page {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl Page {
    fn bounds(&self) -> (usize, usize) {
        (
            self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE),
            self.offset.unwrap_or(0),
        )
    }
}

#[derive(Deserialize)]
pub struct NewValueRequest {
    name: String,
    description: String,
    #[serde(default)]
    guidance: ConstraintSet,
}

#[derive(Deserialize)]
pub struct NewBeliefRequest {
    name: String,
    description: String,
    #[serde(default)]
    related_values: BTreeSet<ValueId>,
    #[serde(default)]
    guidance: ConstraintSet,
}

pub async fn list_values(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Value>>> {
    let (limit, offset) = page.bounds();
    Ok(Json(state.knowledge().list_values(limit, offset)?))
}

pub async fn add_value(
    State(state): State<AppState>,
    Json(req): Json<NewValueRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let value = state
        .curator
        .add_value(&req.name, &req.description, req.guidance)
        .await?;
    Ok((StatusCode::CREATED, Json(value)))
}

pub async fn edit_value(
    State(state): State<AppState>,
    Path(id): Path<ValueId>,
    Json(edit): Json<KnowledgeEdit>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.curator.edit_value(id, edit).await?))
}

pub async fn delete_value(
    State(state): State<AppState>,
    Path(id): Path<ValueId>,
) -> ApiResult<StatusCode> {
    state.knowledge().delete_value(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_beliefs(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Belief>>> {
    let (limit, offset) = page.bounds();
    Ok(Json(state.knowledge().list_beliefs(limit, offset)?))
}

pub async fn add_belief(
    State(state): State<AppState>,
    Json(req): Json<NewBeliefRequest>,
) -> ApiResult<(StatusCode, Json<Belief>)> {
    let belief = state
        .curator
        .add_belief(&req.name, &req.description, req.related_values, req.guidance)
        .await?;
    Ok((StatusCode::CREATED, Json(belief)))
}

pub async fn edit_belief(
    State(state): State<AppState>,
    Path(id): Path<BeliefId>,
    Json(edit): Json<KnowledgeEdit>,
) -> ApiResult<Json<Belief>> {
    Ok(Json(state.curator.edit_belief(id, edit).await?))
}

pub async fn delete_belief(
    State(state): State<AppState>,
    Path(id): Path<BeliefId>,
) -> ApiResult<StatusCode> {
    state.knowledge().delete_belief(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ontology_summary(
    State(state): State<AppState>,
) -> ApiResult<Json<mothership_memory::ontology::OntologySummary>> {
    Ok(Json(state.knowledge().summary()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_context_appends_user_context() {
        let req = DirectiveRequest {
            task_description: "solve 2x+3=7".into(),
            task_type: "math".into(),
            user_context: Some("  grade 8 ".into()),
        };
        assert_eq!(req.context(), "solve 2x+3=7\ngrade 8");

        let bare = DirectiveRequest {
            user_context: Some("   ".into()),
            ..req
        };
        assert_eq!(bare.context(), "solve 2x+3=7");
    }

    #[test]
    fn page_bounds_are_capped() {
        let page = Page {
            limit: Some(10_000),
            offset: None,
        };
        assert_eq!(page.bounds(), (MAX_PAGE, 0));
    }
}

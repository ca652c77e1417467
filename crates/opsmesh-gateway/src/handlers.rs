use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use opsmesh_core::{AgentRecord, Heartbeat, OpsMeshError, Payload, TaskResponse};
use opsmesh_orchestrator::{Correlation, FlowDefinition, QueueEntry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

type ApiResult<T> = Result<T, ApiError>;

/// Parses a JSON body; an empty body yields `T::default()`.
fn parse_or_default<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse(body)
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn instance_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("'{raw}' is not an instance id")))
}

/// `GET /health`.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "opsmesh"}))
}

// --- Flows ---

/// Query string of `GET /flows`.
#[derive(Debug, Deserialize)]
pub struct FlowFilter {
    pub category: Option<String>,
}

/// Summary of a registered flow definition.
#[derive(Debug, Serialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: Option<String>,
    pub steps: Vec<String>,
}

impl From<&FlowDefinition> for FlowSummary {
    fn from(def: &FlowDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            version: def.version.clone(),
            description: def.description.clone(),
            category: def.category().map(str::to_string),
            steps: def.steps.iter().map(|s| s.step_id.clone()).collect(),
        }
    }
}

/// `GET /flows`, optionally `?category=`.
pub async fn list_flows(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FlowFilter>,
) -> Json<Vec<FlowSummary>> {
    let orchestrator = state.coordinator.orchestrator();
    let defs = match filter.category {
        Some(category) => orchestrator.definitions_in_category(&category),
        None => orchestrator.definitions(),
    };
    Json(defs.iter().map(FlowSummary::from).collect())
}

/// `POST /flows/{definition_id}`; the body, if any, is the initial payload.
pub async fn start_flow(
    State(state): State<Arc<AppState>>,
    Path(definition_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let payload: Payload = parse_or_default(&body)?;
    let instance_id = state
        .coordinator
        .orchestrator()
        .start_flow(&definition_id, payload)
        .await?;
    info!(definition_id = %definition_id, instance_id = %instance_id, "Flow started via API");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"instance_id": instance_id})),
    ))
}

/// `GET /flows/{instance_id}`.
pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .coordinator
        .orchestrator()
        .get_flow_status(instance_id(&raw_id)?)?;
    Ok(Json(instance))
}

/// `POST /flows/{instance_id}/cancel`.
pub async fn cancel_flow(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = instance_id(&raw_id)?;
    let status = state.coordinator.orchestrator().cancel(id).await?;
    Ok(Json(serde_json::json!({"instance_id": id, "status": status})))
}

// --- Agents ---

/// `GET /agents`.
pub async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.registry().list())
}

/// `GET /agents/stats`.
pub async fn agent_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.coordinator.registry().stats())
}

/// Body of `POST /agents`.
#[derive(Debug, Deserialize)]
pub struct RegisterAgent {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// `http(s)://` base URL where the agent accepts messages.
    pub endpoint: String,
}

/// `POST /agents`. Only agents reachable over HTTP can register here;
/// in-process agents are attached by the host with their handler.
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req: RegisterAgent = parse(&body)?;
    let display_name = req.display_name.unwrap_or_else(|| req.id.clone());
    let record = AgentRecord::new(req.id, display_name, req.capabilities, req.endpoint);
    let record = state.coordinator.attach_remote(record)?;
    info!(agent_id = %record.id, endpoint = %record.endpoint, "Remote agent registered via API");
    Ok((StatusCode::CREATED, Json(record)))
}

/// `DELETE /agents/{id}`.
pub async fn remove_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .coordinator
        .detach(&agent_id)
        .ok_or_else(|| OpsMeshError::UnknownAgent(agent_id.clone()))?;
    Ok(Json(record))
}

/// Body of `POST /agents/{id}/heartbeat`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub load: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `POST /agents/{id}/heartbeat`.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let beat: HeartbeatBody = parse_or_default(&body)?;
    let status = state.coordinator.registry().apply_heartbeat(&Heartbeat {
        agent_id,
        capabilities: beat.capabilities,
        current_load: beat.load,
    })?;
    Ok(Json(serde_json::json!({"ok": true, "status": status})))
}

/// `POST /responses`: a remote agent answering a task asynchronously.
pub async fn task_response(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let response: TaskResponse = parse(&body)?;
    let correlation = match state.coordinator.router().correlate_response(response) {
        Correlation::Delivered => "delivered",
        Correlation::Progress => "progress",
        Correlation::Unmatched => "unmatched",
    };
    Ok(Json(serde_json::json!({"ok": true, "correlation": correlation})))
}

// --- Queue ---

/// Body of `POST /queue/estimate`.
#[derive(Debug, Deserialize)]
pub struct EstimateRequest {
    pub entries: Vec<QueueEntry>,
    pub target: QueueEntry,
}

/// `POST /queue/estimate`.
pub async fn queue_estimate(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req: EstimateRequest = parse(&body)?;
    let calc = &state.queue;
    Ok(Json(serde_json::json!({
        "position": calc.position(&req.entries, &req.target),
        "estimated_wait_minutes": calc.estimate_wait(&req.entries, &req.target),
        "metrics": calc.metrics(&req.entries),
    })))
}

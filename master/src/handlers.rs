use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use common::{
    AbortResponse, AgentHeartbeatRequest, AgentHeartbeatResponse, AgentRegisterRequest,
    AgentRegisterResponse, CommandsRequest, CommandsResponse, ErrorBody, ExecuteActionRequest,
    HostMetrics, PlanError, RequestId, RequestListQuery, RequestStatusReport, RequestSummary,
    ReportsRequest, ReportsResponse, SubmitRequest, SubmitResponse,
};

use std::sync::Arc;

use crate::action_manager::{ActionError, ActionManager};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/clusters/:cluster/requests", post(submit_request))
        .route("/api/v1/clusters/:cluster/actions", post(execute_action))
        .route("/api/v1/requests", get(list_requests))
        .route("/api/v1/requests/:id", get(get_request))
        .route("/api/v1/requests/:id/abort", post(abort_request))
        .route("/api/v1/hosts", get(list_hosts))
        .route("/api/v1/agents/register", post(register_agent))
        .route("/api/v1/agents/heartbeat", post(agent_heartbeat))
        .route("/api/v1/agents/commands", post(pull_commands))
        .route("/api/v1/agents/reports", post(push_reports))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        let status = match &err {
            ActionError::Plan(PlanError::Validation(_)) => StatusCode::BAD_REQUEST,
            ActionError::Plan(PlanError::GraphCycle(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ActionError::RequestNotFound(_) | ActionError::ClusterMismatch { .. } => StatusCode::NOT_FOUND,
            ActionError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("error interno atendiendo request: {}", err);
        }
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Las operaciones del ActionManager tocan el store (fsync con el store en
/// archivo), así que corren en el pool bloqueante.
async fn run_blocking<T, F>(actions: Arc<ActionManager>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ActionManager) -> Result<T, ActionError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&actions))
        .await
        .map_err(|e| {
            warn!("operación del store abortada: {}", e);
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "operación del store abortada")
        })?
        .map_err(ApiError::from)
}

/* ---------------- clientes ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_request(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<SubmitResponse> {
    state.actions.check_cluster(&cluster)?;
    let resp = run_blocking(state.actions.clone(), move |actions| {
        actions.submit_stages(&req.context, req.stages)
    })
    .await?;
    Ok(Json(resp))
}

async fn execute_action(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<ExecuteActionRequest>,
) -> ApiResult<SubmitResponse> {
    state.actions.check_cluster(&cluster)?;
    let resp = run_blocking(state.actions.clone(), move |actions| actions.execute_action(&req)).await?;
    Ok(Json(resp))
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<RequestListQuery>,
) -> ApiResult<Vec<RequestSummary>> {
    let requests = run_blocking(state.actions.clone(), move |actions| actions.list_requests(&query)).await?;
    Ok(Json(requests))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult<RequestStatusReport> {
    let report = run_blocking(state.actions.clone(), move |actions| actions.get_request_status(id)).await?;
    Ok(Json(report))
}

async fn abort_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> ApiResult<AbortResponse> {
    let resp = run_blocking(state.actions.clone(), move |actions| actions.abort_request(id)).await?;
    Ok(Json(resp))
}

async fn list_hosts(State(state): State<AppState>) -> Json<Vec<HostMetrics>> {
    Json(state.agents.metrics())
}

/* ---------------- agentes ---------------- */

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRegisterRequest>,
) -> Json<AgentRegisterResponse> {
    if !state.actions.topology().has_host(&req.host_name) {
        warn!("host {} se registró pero no pertenece a la topología", req.host_name);
    }
    state.agents.register(&req.host_name, req.max_concurrency);
    Json(AgentRegisterResponse {
        ok: true,
        heartbeat_interval_secs: state.heartbeat_interval_secs,
    })
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<AgentHeartbeatRequest>,
) -> Result<Json<AgentHeartbeatResponse>, StatusCode> {
    if state.agents.heartbeat(&req.host_name, req.cpu_percent, req.mem_bytes) {
        Ok(Json(AgentHeartbeatResponse { ok: true }))
    } else {
        // el agente tiene que volver a registrarse
        Err(StatusCode::NOT_FOUND)
    }
}

async fn pull_commands(
    State(state): State<AppState>,
    Json(req): Json<CommandsRequest>,
) -> Result<Json<CommandsResponse>, StatusCode> {
    let commands = state
        .agents
        .take_commands(&req.host_name, req.max_commands as usize)
        .ok_or(StatusCode::NOT_FOUND)?;
    if !commands.is_empty() {
        info!("entregando {} comandos a {}", commands.len(), req.host_name);
    }
    Ok(Json(CommandsResponse { commands }))
}

async fn push_reports(
    State(state): State<AppState>,
    Json(req): Json<ReportsRequest>,
) -> Result<Json<ReportsResponse>, StatusCode> {
    if !state.agents.note_reports(&req.host_name, req.reports.len()) {
        return Err(StatusCode::NOT_FOUND);
    }
    let accepted = state.reports.push_all(req.reports);
    Ok(Json(ReportsResponse { accepted }))
}

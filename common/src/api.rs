use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::request::RequestId;
use crate::stage::StagePlan;
use crate::status::RequestStatus;
use crate::task::TaskShortStatus;
use crate::topology::HostName;

/// Request armado por el cliente: cada stage candidato pasa por el grafo de roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub context: String,
    pub stages: Vec<StagePlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: RequestId,
    pub stage_count: usize,
    pub task_count: usize,
}

/// Filtro de recursos de una acción: servicio, componente opcional y hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub service_name: String,
    #[serde(default)]
    pub component_name: Option<String>,
    /// Vacío = todos los hosts del componente.
    #[serde(default)]
    pub hosts: Vec<HostName>,
}

/// Acción de alto nivel (SERVICE_CHECK, RESTART, DECOMMISSION, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteActionRequest {
    pub command_name: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub resource_filters: Vec<ResourceFilter>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatusReport {
    pub request_id: RequestId,
    pub cluster_name: String,
    pub context: String,
    pub status: RequestStatus,
    pub abort_requested: bool,
    pub create_time: DateTime<Utc>,
    pub progress_percent: f64,
    pub stage_count: usize,
    pub task_count: usize,
    pub tasks: Vec<TaskShortStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub request_id: RequestId,
    pub context: String,
    pub status: RequestStatus,
    pub create_time: DateTime<Utc>,
    pub task_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestListQuery {
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub ascending: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub request_id: RequestId,
    pub abort_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

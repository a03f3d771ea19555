use serde::{Deserialize, Serialize};

use crate::request::RequestId;
use crate::role::{Role, RoleCommand};
use crate::stage::StageId;
use crate::task::{CommandPayload, TaskId};
use crate::topology::{ClusterHostInfo, HostName};

/* --------- Registro y heartbeats de agentes --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
    pub host_name: HostName,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterResponse {
    pub ok: bool,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatRequest {
    pub host_name: HostName,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatResponse {
    pub ok: bool,
}

/* --------- Comandos hacia el agente --------- */

/// Lo que viaja al host. `command_type` es la etiqueta del RoleCommand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub dispatch_id: String,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub stage_id: StageId,
    pub attempt: u32,
    pub host_name: HostName,
    pub role: Role,
    pub role_command: RoleCommand,
    pub command_type: String,
    #[serde(default)]
    pub custom_command: Option<String>,
    pub payload: CommandPayload,
    pub cluster_host_info: ClusterHostInfo,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsRequest {
    pub host_name: HostName,
    /// Máximo de comandos que el agente puede aceptar ahora.
    pub max_commands: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsResponse {
    pub commands: Vec<AgentCommand>,
}

/* --------- Reportes desde el agente --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    /// Progreso intermedio: sólo actualiza la salida capturada.
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    pub task_id: TaskId,
    pub attempt: u32,
    pub host_name: HostName,
    pub status: ReportStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsRequest {
    pub host_name: HostName,
    pub reports: Vec<CommandReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsResponse {
    pub accepted: usize,
}

/* --------- Métricas de hosts --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    Healthy,
    HeartbeatLost,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostMetrics {
    pub host_name: HostName,
    pub state: HostState,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub queued_commands: usize,
    pub commands_dispatched: u64,
    pub reports_received: u64,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}

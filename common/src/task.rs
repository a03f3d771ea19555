use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::role::{Role, RoleCommand};
use crate::stage::StageId;
use crate::request::RequestId;
use crate::status::{HostRoleStatus, InvalidTransition};
use crate::topology::HostName;

pub type TaskId = u64;

/// Parámetro con el que un request puede forzar el timeout de un comando (segundos).
pub const COMMAND_TIMEOUT_PARAM: &str = "command_timeout";

/// Carga útil del comando. El scheduler no la interpreta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub command_params: BTreeMap<String, String>,
    #[serde(default)]
    pub role_params: BTreeMap<String, String>,
    /// tipo de config -> {"tag": ...}
    #[serde(default)]
    pub configuration_tags: BTreeMap<String, BTreeMap<String, String>>,
}

/// Comando candidato, todavía sin ids ni estado. Es lo que entra al grafo de roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub host_name: HostName,
    pub role: Role,
    pub role_command: RoleCommand,
    #[serde(default)]
    pub payload: CommandPayload,
    /// Si es None se resuelve con los timeouts por defecto al construir el request.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub command_detail: Option<String>,
}

impl CommandSpec {
    pub fn new(host_name: impl Into<String>, role: impl Into<Role>, role_command: RoleCommand) -> Self {
        CommandSpec {
            host_name: host_name.into(),
            role: role.into(),
            role_command,
            payload: CommandPayload::default(),
            timeout_secs: None,
            command_detail: None,
        }
    }

    pub fn with_payload(mut self, payload: CommandPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Tarea: un rol-comando sobre un host dentro de un stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoleCommand {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub stage_id: StageId,
    pub host_name: HostName,
    pub role: Role,
    pub role_command: RoleCommand,
    pub payload: CommandPayload,
    pub status: HostRoleStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Intentos de ejecución contados (sólo despachos aceptados).
    pub attempt_count: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub command_detail: Option<String>,
}

impl HostRoleCommand {
    pub fn from_spec(
        spec: CommandSpec,
        task_id: TaskId,
        request_id: RequestId,
        stage_id: StageId,
        default_timeout_secs: u64,
    ) -> Self {
        HostRoleCommand {
            task_id,
            request_id,
            stage_id,
            host_name: spec.host_name,
            role: spec.role,
            role_command: spec.role_command,
            payload: spec.payload,
            status: HostRoleStatus::Pending,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            start_time: None,
            end_time: None,
            attempt_count: 0,
            timeout_secs: spec.timeout_secs.unwrap_or(default_timeout_secs),
            command_detail: spec.command_detail,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Cambia de estado validando la máquina de estados.
    pub fn transition_to(&mut self, next: HostRoleStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marca el comienzo de un nuevo intento de ejecución.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition_to(HostRoleStatus::InProgress)?;
        self.attempt_count += 1;
        self.start_time = Some(now);
        self.end_time = None;
        self.exit_code = None;
        Ok(())
    }

    /// Superó su timeout estando IN_PROGRESS.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.status != HostRoleStatus::InProgress {
            return false;
        }
        match self.start_time {
            Some(start) => match (now - start).to_std() {
                Ok(elapsed) => elapsed > self.timeout(),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Resumen corto para listados de estado.
    pub fn short_status(&self) -> TaskShortStatus {
        TaskShortStatus {
            task_id: self.task_id,
            stage_id: self.stage_id,
            host_name: self.host_name.clone(),
            role: self.role.clone(),
            role_command: self.role_command.clone(),
            status: self.status,
            exit_code: self.exit_code,
            attempt_count: self.attempt_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskShortStatus {
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub host_name: HostName,
    pub role: Role,
    pub role_command: RoleCommand,
    pub status: HostRoleStatus,
    pub exit_code: Option<i32>,
    pub attempt_count: u32,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::PlanError;
use crate::role::RoleCommand;
use crate::role_command_order::RoleCommandOrder;
use crate::role_graph::RoleGraph;
use crate::stage::{StageId, StagePlan};
use crate::task::{CommandSpec, COMMAND_TIMEOUT_PARAM};
use crate::topology::{ClusterHostInfo, ClusterTopology};

pub type RequestId = u64;

/// Intención del cliente, partida en stages ordenados.
/// El estado agregado no se guarda: se deriva siempre de las tareas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub cluster_name: String,
    pub context: String,
    pub cluster_host_info: ClusterHostInfo,
    pub stage_ids: Vec<StageId>,
    pub create_time: DateTime<Utc>,
    /// Marcado por abort; el scheduler lo aplica en la siguiente pasada.
    #[serde(default)]
    pub abort_requested: bool,
}

/// Timeouts por defecto cuando el comando no trae uno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutDefaults {
    pub default_secs: u64,
    pub install_secs: u64,
}

impl Default for TimeoutDefaults {
    fn default() -> Self {
        TimeoutDefaults {
            default_secs: 600,
            install_secs: 1800,
        }
    }
}

impl TimeoutDefaults {
    /// Explícito > parámetro `command_timeout` > por tipo de comando.
    pub fn resolve(&self, spec: &CommandSpec) -> u64 {
        if let Some(secs) = spec.timeout_secs {
            return secs;
        }
        if let Some(secs) = spec
            .payload
            .command_params
            .get(COMMAND_TIMEOUT_PARAM)
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            return secs;
        }
        match spec.role_command {
            RoleCommand::Install => self.install_secs,
            _ => self.default_secs,
        }
    }
}

/// Stage ya ordenado con su id asignado, todavía no persistido.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub stage_id: StageId,
    pub plan: StagePlan,
}

/// Contenedor ordenado de stages de un request en construcción.
///
/// Cada `add_stage` pasa el candidato por el grafo de roles y agrega los stages
/// resultantes en orden, con ids consecutivos.
pub struct RequestStageContainer<'a> {
    topology: &'a ClusterTopology,
    order: &'a RoleCommandOrder,
    timeouts: TimeoutDefaults,
    context: String,
    stages: Vec<PlannedStage>,
    last_stage_id: StageId,
}

impl<'a> RequestStageContainer<'a> {
    pub fn new(
        topology: &'a ClusterTopology,
        order: &'a RoleCommandOrder,
        context: impl Into<String>,
    ) -> Self {
        RequestStageContainer {
            topology,
            order,
            timeouts: TimeoutDefaults::default(),
            context: context.into(),
            stages: Vec::new(),
            last_stage_id: 0,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutDefaults) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn cluster_name(&self) -> &str {
        &self.topology.cluster_name
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn last_stage_id(&self) -> StageId {
        self.last_stage_id
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.plan.commands.len()).sum()
    }

    pub fn cluster_host_info(&self) -> ClusterHostInfo {
        self.topology.cluster_host_info()
    }

    fn validate(&self, candidate: &StagePlan) -> Result<(), PlanError> {
        if candidate.is_empty() {
            return Err(PlanError::validation("el stage no tiene comandos"));
        }
        let mut seen = HashSet::new();
        for cmd in &candidate.commands {
            if !self.topology.has_host(&cmd.host_name) {
                return Err(PlanError::validation(format!(
                    "host {} no pertenece al cluster {}",
                    cmd.host_name, self.topology.cluster_name
                )));
            }
            if !self.topology.has_role(&cmd.role) {
                return Err(PlanError::validation(format!(
                    "rol {} no existe en el cluster {}",
                    cmd.role, self.topology.cluster_name
                )));
            }
            if !seen.insert((cmd.host_name.as_str(), &cmd.role)) {
                return Err(PlanError::validation(format!(
                    "rol {} repetido en el host {}",
                    cmd.role, cmd.host_name
                )));
            }
        }
        Ok(())
    }

    /// Valida, ordena y agrega. Si falla no modifica el contenedor.
    pub fn add_stage(&mut self, candidate: StagePlan) -> Result<&[PlannedStage], PlanError> {
        self.validate(&candidate)?;
        let ordered = RoleGraph::new(self.order).build(&candidate)?;

        let first = self.stages.len();
        for mut plan in ordered {
            for cmd in &mut plan.commands {
                cmd.timeout_secs = Some(self.timeouts.resolve(cmd));
            }
            self.last_stage_id += 1;
            self.stages.push(PlannedStage {
                stage_id: self.last_stage_id,
                plan,
            });
        }
        Ok(&self.stages[first..])
    }

    pub fn into_stages(self) -> Vec<PlannedStage> {
        self.stages
    }
}

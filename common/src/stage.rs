use serde::{Deserialize, Serialize};

use crate::request::RequestId;
use crate::task::{CommandSpec, TaskId};
use crate::topology::ClusterHostInfo;

pub type StageId = u64;

/// Stage candidato: comandos que todavía no pasaron por el grafo de roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    #[serde(default)]
    pub context: String,
    /// Tolera fallos de sus tareas sin tumbar el request.
    #[serde(default)]
    pub skippable: bool,
    pub commands: Vec<CommandSpec>,
}

impl StagePlan {
    pub fn new(context: impl Into<String>) -> Self {
        StagePlan {
            context: context.into(),
            skippable: false,
            commands: Vec::new(),
        }
    }

    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Stage persistido. Su estructura no cambia después de creado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub request_id: RequestId,
    pub stage_id: StageId,
    pub context: String,
    pub skippable: bool,
    pub cluster_host_info: ClusterHostInfo,
    pub task_ids: Vec<TaskId>,
}

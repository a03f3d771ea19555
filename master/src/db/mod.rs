//! Acceso durable a requests, stages y tareas.
//!
//! El scheduler sólo ve el estado persistido a través de [`ActionDbAccessor`].
//! Hay dos implementaciones: [`InMemoryActionDb`] (tests, desarrollo) y
//! [`FileActionDb`] (snapshot JSON con escritura atómica).

mod file;
mod in_memory;

pub use file::FileActionDb;
pub use in_memory::InMemoryActionDb;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use common::{
    derive_aborted_request_status, derive_request_status, HostRoleCommand, HostRoleStatus, Request,
    RequestId, RequestStatus, Stage, StageId, StageSummary, TaskId,
};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("lock del store envenenado")]
    Poisoned,
    #[error("request {0} no existe")]
    RequestNotFound(RequestId),
    #[error("stage {1} del request {0} no existe")]
    StageNotFound(RequestId, StageId),
    #[error("tarea {0} no existe")]
    TaskNotFound(TaskId),
    #[error("error de E/S en el store: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot del store inválido: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Cambio de estado de una tarea con su salida.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusUpdate {
    pub status: HostRoleStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskStatusUpdate {
    pub fn new(status: HostRoleStatus, at: DateTime<Utc>) -> Self {
        TaskStatusUpdate {
            status,
            exit_code: None,
            stdout: None,
            stderr: None,
            at,
        }
    }

    pub fn with_output(mut self, exit_code: Option<i32>, stdout: &str, stderr: &str) -> Self {
        self.exit_code = exit_code;
        self.stdout = Some(stdout.to_string());
        self.stderr = Some(stderr.to_string());
        self
    }
}

/// Contrato de persistencia. Cada operación es atómica a nivel de una entidad.
pub trait ActionDbAccessor: Send + Sync {
    fn allocate_request_id(&self) -> Result<RequestId>;
    fn allocate_task_ids(&self, count: usize) -> Result<Vec<TaskId>>;

    fn persist_request(&self, request: &Request) -> Result<()>;
    fn persist_stage(&self, stage: &Stage) -> Result<()>;
    fn persist_task(&self, task: &HostRoleCommand) -> Result<()>;

    /// Request nuevo con toda su estructura: tareas, después stages, al final el request.
    /// Los stores durables lo escriben de una sola vez.
    fn persist_request_tree(&self, request: &Request, stages: &[Stage], tasks: &[HostRoleCommand]) -> Result<()> {
        for task in tasks {
            self.persist_task(task)?;
        }
        for stage in stages {
            self.persist_stage(stage)?;
        }
        self.persist_request(request)
    }

    fn get_request(&self, request_id: RequestId) -> Result<Option<Request>>;
    /// Todos los requests, por id ascendente.
    fn get_requests(&self) -> Result<Vec<Request>>;
    fn get_stages_for_request(&self, request_id: RequestId) -> Result<Vec<Stage>>;
    fn get_tasks_for_stage(&self, request_id: RequestId, stage_id: StageId) -> Result<Vec<HostRoleCommand>>;
    fn get_task(&self, task_id: TaskId) -> Result<Option<HostRoleCommand>>;

    fn update_task_status(&self, task_id: TaskId, update: TaskStatusUpdate) -> Result<HostRoleCommand>;

    /// Requests con al menos una tarea no terminal.
    fn get_in_flight_requests(&self) -> Result<Vec<Request>>;

    fn mark_request_aborted(&self, request_id: RequestId) -> Result<()>;
}

/// Estado completo del store. Lo comparten las dos implementaciones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    next_request_id: RequestId,
    next_task_id: TaskId,
    requests: BTreeMap<RequestId, Request>,
    stages: BTreeMap<RequestId, BTreeMap<StageId, Stage>>,
    tasks: BTreeMap<TaskId, HostRoleCommand>,
}

impl StoreState {
    pub(crate) fn allocate_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub(crate) fn allocate_task_ids(&mut self, count: usize) -> Vec<TaskId> {
        (0..count)
            .map(|_| {
                self.next_task_id += 1;
                self.next_task_id
            })
            .collect()
    }

    pub(crate) fn persist_request(&mut self, request: &Request) {
        // los ids nunca se reutilizan, aunque vengan de afuera
        self.next_request_id = self.next_request_id.max(request.request_id);
        self.requests.insert(request.request_id, request.clone());
    }

    pub(crate) fn persist_stage(&mut self, stage: &Stage) {
        self.stages
            .entry(stage.request_id)
            .or_default()
            .insert(stage.stage_id, stage.clone());
    }

    pub(crate) fn persist_task(&mut self, task: &HostRoleCommand) {
        self.next_task_id = self.next_task_id.max(task.task_id);
        self.tasks.insert(task.task_id, task.clone());
    }

    pub(crate) fn get_request(&self, request_id: RequestId) -> Option<Request> {
        self.requests.get(&request_id).cloned()
    }

    pub(crate) fn get_requests(&self) -> Vec<Request> {
        self.requests.values().cloned().collect()
    }

    pub(crate) fn get_stages_for_request(&self, request_id: RequestId) -> Vec<Stage> {
        self.stages
            .get(&request_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn get_tasks_for_stage(
        &self,
        request_id: RequestId,
        stage_id: StageId,
    ) -> Result<Vec<HostRoleCommand>> {
        let stage = self
            .stages
            .get(&request_id)
            .and_then(|m| m.get(&stage_id))
            .ok_or(PersistenceError::StageNotFound(request_id, stage_id))?;
        stage
            .task_ids
            .iter()
            .map(|id| {
                self.tasks
                    .get(id)
                    .cloned()
                    .ok_or(PersistenceError::TaskNotFound(*id))
            })
            .collect()
    }

    pub(crate) fn get_task(&self, task_id: TaskId) -> Option<HostRoleCommand> {
        self.tasks.get(&task_id).cloned()
    }

    pub(crate) fn update_task_status(
        &mut self,
        task_id: TaskId,
        update: TaskStatusUpdate,
    ) -> Result<HostRoleCommand> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(PersistenceError::TaskNotFound(task_id))?;
        task.status = update.status;
        if update.exit_code.is_some() {
            task.exit_code = update.exit_code;
        }
        if let Some(stdout) = update.stdout {
            task.stdout = stdout;
        }
        if let Some(stderr) = update.stderr {
            task.stderr = stderr;
        }
        if update.status.is_terminal() {
            task.end_time = Some(update.at);
        }
        Ok(task.clone())
    }

    pub(crate) fn get_in_flight_requests(&self) -> Vec<Request> {
        self.requests
            .values()
            .filter(|r| {
                self.stages
                    .get(&r.request_id)
                    .map(|stages| {
                        stages.values().flat_map(|s| s.task_ids.iter()).any(|id| {
                            self.tasks
                                .get(id)
                                .map(|t| !t.status.is_terminal())
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub(crate) fn mark_request_aborted(&mut self, request_id: RequestId) -> Result<()> {
        let request = self
            .requests
            .get_mut(&request_id)
            .ok_or(PersistenceError::RequestNotFound(request_id))?;
        request.abort_requested = true;
        Ok(())
    }
}

/// Request con sus stages y tareas tal como están persistidos.
#[derive(Debug, Clone)]
pub struct RequestView {
    pub request: Request,
    pub stages: Vec<(Stage, Vec<HostRoleCommand>)>,
}

impl RequestView {
    pub fn load(db: &dyn ActionDbAccessor, request: Request) -> Result<Self> {
        let mut stages = Vec::new();
        for stage in db.get_stages_for_request(request.request_id)? {
            let tasks = db.get_tasks_for_stage(request.request_id, stage.stage_id)?;
            stages.push((stage, tasks));
        }
        stages.sort_by_key(|(s, _)| s.stage_id);
        Ok(RequestView { request, stages })
    }

    pub fn load_by_id(db: &dyn ActionDbAccessor, request_id: RequestId) -> Result<Option<Self>> {
        match db.get_request(request_id)? {
            Some(request) => Ok(Some(Self::load(db, request)?)),
            None => Ok(None),
        }
    }

    pub fn summaries(&self) -> Vec<StageSummary> {
        self.stages
            .iter()
            .map(|(stage, tasks)| {
                StageSummary::from_statuses(stage.skippable, tasks.iter().map(|t| t.status))
            })
            .collect()
    }

    pub fn status(&self) -> RequestStatus {
        let summaries = self.summaries();
        if self.request.abort_requested {
            return derive_aborted_request_status(&summaries);
        }
        derive_request_status(&summaries)
    }

    /// Primer stage que todavía no habilita al siguiente.
    pub fn eligible_stage(&self) -> Option<usize> {
        self.summaries().iter().position(|s| !s.allows_next_stage())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &HostRoleCommand> {
        self.stages.iter().flat_map(|(_, tasks)| tasks.iter())
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|(_, t)| t.len()).sum()
    }

    pub fn progress_percent(&self) -> f64 {
        let total = self.task_count();
        if total == 0 {
            return 100.0;
        }
        let done = self.tasks().filter(|t| t.status.is_terminal()).count();
        (done as f64 / total as f64) * 100.0
    }
}

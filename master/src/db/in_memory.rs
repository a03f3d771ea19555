use std::sync::{Mutex, MutexGuard};

use common::{HostRoleCommand, Request, RequestId, Stage, StageId, TaskId};

use super::{ActionDbAccessor, PersistenceError, Result, StoreState, TaskStatusUpdate};

/// Store en memoria. Se pierde al reiniciar el master.
#[derive(Debug, Default)]
pub struct InMemoryActionDb {
    state: Mutex<StoreState>,
}

impl InMemoryActionDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| PersistenceError::Poisoned)
    }
}

impl ActionDbAccessor for InMemoryActionDb {
    fn allocate_request_id(&self) -> Result<RequestId> {
        Ok(self.lock()?.allocate_request_id())
    }

    fn allocate_task_ids(&self, count: usize) -> Result<Vec<TaskId>> {
        Ok(self.lock()?.allocate_task_ids(count))
    }

    fn persist_request(&self, request: &Request) -> Result<()> {
        self.lock()?.persist_request(request);
        Ok(())
    }

    fn persist_stage(&self, stage: &Stage) -> Result<()> {
        self.lock()?.persist_stage(stage);
        Ok(())
    }

    fn persist_task(&self, task: &HostRoleCommand) -> Result<()> {
        self.lock()?.persist_task(task);
        Ok(())
    }

    fn get_request(&self, request_id: RequestId) -> Result<Option<Request>> {
        Ok(self.lock()?.get_request(request_id))
    }

    fn get_requests(&self) -> Result<Vec<Request>> {
        Ok(self.lock()?.get_requests())
    }

    fn get_stages_for_request(&self, request_id: RequestId) -> Result<Vec<Stage>> {
        Ok(self.lock()?.get_stages_for_request(request_id))
    }

    fn get_tasks_for_stage(&self, request_id: RequestId, stage_id: StageId) -> Result<Vec<HostRoleCommand>> {
        self.lock()?.get_tasks_for_stage(request_id, stage_id)
    }

    fn get_task(&self, task_id: TaskId) -> Result<Option<HostRoleCommand>> {
        Ok(self.lock()?.get_task(task_id))
    }

    fn update_task_status(&self, task_id: TaskId, update: TaskStatusUpdate) -> Result<HostRoleCommand> {
        self.lock()?.update_task_status(task_id, update)
    }

    fn get_in_flight_requests(&self) -> Result<Vec<Request>> {
        Ok(self.lock()?.get_in_flight_requests())
    }

    fn mark_request_aborted(&self, request_id: RequestId) -> Result<()> {
        self.lock()?.mark_request_aborted(request_id)
    }
}

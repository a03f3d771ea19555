use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use common::{HostRoleCommand, Request, RequestId, Stage, StageId, TaskId};

use super::{ActionDbAccessor, PersistenceError, Result, StoreState, TaskStatusUpdate};

/// Store durable: todo el estado vive en un snapshot JSON.
///
/// Cada escritura arma el estado nuevo sobre una copia, lo escribe a un archivo
/// temporal en el mismo directorio y lo renombra sobre el snapshot. Si algo falla
/// el estado en memoria no cambia.
///
/// El costo de cada escritura crece con todo el historial: no hay archivado de
/// requests terminados. Sirve para clusters chicos y para desarrollo.
#[derive(Debug)]
pub struct FileActionDb {
    path: PathBuf,
    state: Mutex<StoreState>,
    writes: AtomicU64,
}

impl FileActionDb {
    /// Abre el snapshot en `path`, o arranca vacío si no existe.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read(&path)?;
            let state: StoreState = serde_json::from_slice(&raw)?;
            info!(
                "store recuperado desde {} ({} requests)",
                path.display(),
                state.get_requests().len()
            );
            state
        } else {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            StoreState::default()
        };
        Ok(FileActionDb {
            path,
            state: Mutex::new(state),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshots escritos desde que se abrió.
    pub fn snapshot_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| PersistenceError::Poisoned)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.write_snapshot(&next)?;
        *guard = next;
        Ok(out)
    }

    fn write_snapshot(&self, state: &StoreState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let bytes = serde_json::to_vec(state)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| PersistenceError::Io(e.error))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("snapshot escrito en {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }
}

impl ActionDbAccessor for FileActionDb {
    fn allocate_request_id(&self) -> Result<RequestId> {
        self.mutate(|s| Ok(s.allocate_request_id()))
    }

    fn allocate_task_ids(&self, count: usize) -> Result<Vec<TaskId>> {
        self.mutate(|s| Ok(s.allocate_task_ids(count)))
    }

    fn persist_request(&self, request: &Request) -> Result<()> {
        self.mutate(|s| {
            s.persist_request(request);
            Ok(())
        })
    }

    fn persist_stage(&self, stage: &Stage) -> Result<()> {
        self.mutate(|s| {
            s.persist_stage(stage);
            Ok(())
        })
    }

    fn persist_task(&self, task: &HostRoleCommand) -> Result<()> {
        self.mutate(|s| {
            s.persist_task(task);
            Ok(())
        })
    }

    fn persist_request_tree(&self, request: &Request, stages: &[Stage], tasks: &[HostRoleCommand]) -> Result<()> {
        self.mutate(|s| {
            for task in tasks {
                s.persist_task(task);
            }
            for stage in stages {
                s.persist_stage(stage);
            }
            s.persist_request(request);
            Ok(())
        })
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
        self.mutate(|s| s.update_task_status(task_id, update))
    }

    fn get_in_flight_requests(&self) -> Result<Vec<Request>> {
        Ok(self.lock()?.get_in_flight_requests())
    }

    fn mark_request_aborted(&self, request_id: RequestId) -> Result<()> {
        self.mutate(|s| s.mark_request_aborted(request_id))
    }
}

//! Frontera entre el scheduler y los agentes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use common::{AgentCommand, CommandReport, HostName, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("host {0} no está registrado")]
    HostNotRegistered(HostName),
    #[error("host {host} sin heartbeat hace {secs}s")]
    HostUnreachable { host: HostName, secs: u64 },
}

/// Comprobante de un despacho aceptado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchHandle {
    pub dispatch_id: String,
    pub host_name: HostName,
    pub task_id: TaskId,
}

/// Entrega comandos a los hosts. Un `Ok` significa que el host quedó
/// responsable del comando; un `Err` que el comando nunca salió.
pub trait AgentDispatcher: Send + Sync {
    fn dispatch(&self, host_name: &str, command: AgentCommand) -> Result<DispatchHandle, DispatchError>;
}

/// Cola de reportes de agentes pendientes de aplicar por el scheduler.
#[derive(Debug, Clone, Default)]
pub struct ReportQueue {
    inner: Arc<Mutex<VecDeque<CommandReport>>>,
}

impl ReportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CommandReport>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, report: CommandReport) {
        self.lock().push_back(report);
    }

    pub fn push_all(&self, reports: impl IntoIterator<Item = CommandReport>) -> usize {
        let mut queue = self.lock();
        let before = queue.len();
        queue.extend(reports);
        queue.len() - before
    }

    /// Saca todo lo acumulado, en orden de llegada.
    pub fn drain(&self) -> Vec<CommandReport> {
        self.lock().drain(..).collect()
    }

    /// Devuelve reportes al frente de la cola para la próxima pasada.
    pub fn requeue(&self, reports: Vec<CommandReport>) {
        let mut queue = self.lock();
        for report in reports.into_iter().rev() {
            queue.push_front(report);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

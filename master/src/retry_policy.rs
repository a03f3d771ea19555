use common::{HostRoleCommand, HostRoleStatus, InvalidTransition};

/// Qué pasó con una tarea después de un intento fallido o vencido.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Vuelve a QUEUED para otro intento.
    Retry,
    /// Queda FAILED.
    GiveUp,
}

/// Reintentos acotados por tarea. Sólo cuentan los despachos aceptados.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRetryPolicy {
    max_attempts: u32,
}

impl TaskRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        TaskRetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, task: &HostRoleCommand, request_open: bool) -> bool {
        request_open && task.attempt_count < self.max_attempts
    }

    /// Aplica la decisión a una tarea en FAILED o TIMEDOUT.
    /// Con el request abortado o fallido nunca se reintenta.
    pub fn apply(
        &self,
        task: &mut HostRoleCommand,
        request_open: bool,
    ) -> Result<RetryDecision, InvalidTransition> {
        if self.should_retry(task, request_open) {
            task.transition_to(HostRoleStatus::Queued)?;
            return Ok(RetryDecision::Retry);
        }
        if task.status != HostRoleStatus::Failed {
            task.transition_to(HostRoleStatus::Failed)?;
        }
        Ok(RetryDecision::GiveUp)
    }
}

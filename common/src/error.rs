use thiserror::Error;

use crate::role_graph::GraphCycleError;

/// Errores al armar un request. Se devuelven al cliente antes de crear cualquier tarea.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("request inválido: {0}")]
    Validation(String),
    #[error(transparent)]
    GraphCycle(#[from] GraphCycleError),
}

impl PlanError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PlanError::Validation(msg.into())
    }
}

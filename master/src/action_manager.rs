//! Fachada para clientes: submit, consulta de estado, abort y listados.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, enabled, info, Level};

use common::{
    AbortResponse, ClusterTopology, ExecuteActionRequest, HostRoleCommand, PlanError, Request,
    RequestId, RequestListQuery, RequestStageContainer, RequestStatusReport, RequestSummary,
    RoleCommandOrder, RoleGraph, Stage, StagePlan, SubmitResponse, TimeoutDefaults,
};

use crate::custom_command::expand_action;
use crate::db::{ActionDbAccessor, PersistenceError, RequestView};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("request {0} no existe")]
    RequestNotFound(RequestId),
    #[error("el cluster {requested} no está administrado por este master ({managed})")]
    ClusterMismatch { requested: String, managed: String },
}

pub struct ActionManager {
    db: Arc<dyn ActionDbAccessor>,
    topology: Arc<ClusterTopology>,
    order: Arc<RoleCommandOrder>,
    timeouts: TimeoutDefaults,
}

impl ActionManager {
    pub fn new(
        db: Arc<dyn ActionDbAccessor>,
        topology: Arc<ClusterTopology>,
        order: Arc<RoleCommandOrder>,
        timeouts: TimeoutDefaults,
    ) -> Self {
        ActionManager {
            db,
            topology,
            order,
            timeouts,
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn check_cluster(&self, cluster_name: &str) -> Result<(), ActionError> {
        if cluster_name != self.topology.cluster_name {
            return Err(ActionError::ClusterMismatch {
                requested: cluster_name.to_string(),
                managed: self.topology.cluster_name.clone(),
            });
        }
        Ok(())
    }

    /// Contenedor vacío ligado a la topología y tabla de orden del master.
    pub fn container(&self, context: impl Into<String>) -> RequestStageContainer<'_> {
        RequestStageContainer::new(&self.topology, &self.order, context).with_timeouts(self.timeouts)
    }

    /// Ordena cada stage candidato y persiste el request completo.
    pub fn submit_stages(
        &self,
        context: &str,
        candidates: Vec<StagePlan>,
    ) -> Result<SubmitResponse, ActionError> {
        if candidates.is_empty() {
            return Err(PlanError::validation("el request no tiene stages").into());
        }
        let mut container = self.container(context);
        for candidate in candidates {
            if enabled!(Level::DEBUG) {
                debug!(
                    "grafo de roles del stage '{}':\n{}",
                    candidate.context,
                    RoleGraph::new(&self.order).describe(&candidate)
                );
            }
            container.add_stage(candidate)?;
        }
        self.submit(container)
    }

    pub fn execute_action(&self, action: &ExecuteActionRequest) -> Result<SubmitResponse, ActionError> {
        let stage = expand_action(&self.topology, action)?;
        let context = stage.context.clone();
        self.submit_stages(&context, vec![stage])
    }

    /// Persiste tareas y stages antes que el request: un request visible
    /// siempre tiene su estructura completa.
    pub fn submit(&self, container: RequestStageContainer<'_>) -> Result<SubmitResponse, ActionError> {
        if container.stages().is_empty() {
            return Err(PlanError::validation("el request no tiene stages").into());
        }
        let cluster_name = container.cluster_name().to_string();
        let context = container.context().to_string();
        let cluster_host_info = container.cluster_host_info();
        let task_count = container.task_count();

        let request_id = self.db.allocate_request_id()?;
        let mut task_ids = self.db.allocate_task_ids(task_count)?.into_iter();

        let planned = container.into_stages();
        let mut stages = Vec::with_capacity(planned.len());
        let mut tasks = Vec::with_capacity(task_count);
        for stage in planned {
            let mut ids = Vec::with_capacity(stage.plan.commands.len());
            for spec in stage.plan.commands {
                let task_id = task_ids
                    .next()
                    .ok_or_else(|| PersistenceError::Other("faltan ids de tarea".to_string()))?;
                tasks.push(HostRoleCommand::from_spec(
                    spec,
                    task_id,
                    request_id,
                    stage.stage_id,
                    self.timeouts.default_secs,
                ));
                ids.push(task_id);
            }
            stages.push(Stage {
                request_id,
                stage_id: stage.stage_id,
                context: stage.plan.context,
                skippable: stage.plan.skippable,
                cluster_host_info: cluster_host_info.clone(),
                task_ids: ids,
            });
        }

        let stage_count = stages.len();
        let request = Request {
            request_id,
            cluster_name,
            context: context.clone(),
            cluster_host_info,
            stage_ids: stages.iter().map(|s| s.stage_id).collect(),
            create_time: Utc::now(),
            abort_requested: false,
        };
        self.db.persist_request_tree(&request, &stages, &tasks)?;
        info!(
            "request {} creado ({}): {} stages, {} tareas",
            request_id, context, stage_count, task_count
        );

        Ok(SubmitResponse {
            request_id,
            stage_count,
            task_count,
        })
    }

    pub fn get_request_status(&self, request_id: RequestId) -> Result<RequestStatusReport, ActionError> {
        let view = RequestView::load_by_id(self.db.as_ref(), request_id)?
            .ok_or(ActionError::RequestNotFound(request_id))?;
        Ok(RequestStatusReport {
            request_id,
            cluster_name: view.request.cluster_name.clone(),
            context: view.request.context.clone(),
            status: view.status(),
            abort_requested: view.request.abort_requested,
            create_time: view.request.create_time,
            progress_percent: view.progress_percent(),
            stage_count: view.stages.len(),
            task_count: view.task_count(),
            tasks: view.tasks().map(|t| t.short_status()).collect(),
        })
    }

    /// Pide el abort. El scheduler lo aplica en su próxima pasada.
    /// Sobre un request ya terminado no hace nada.
    pub fn abort_request(&self, request_id: RequestId) -> Result<AbortResponse, ActionError> {
        let view = RequestView::load_by_id(self.db.as_ref(), request_id)?
            .ok_or(ActionError::RequestNotFound(request_id))?;
        if view.status().is_terminal() {
            info!("abort ignorado: el request {} ya terminó ({})", request_id, view.status());
            return Ok(AbortResponse {
                request_id,
                abort_requested: view.request.abort_requested,
            });
        }
        self.db.mark_request_aborted(request_id)?;
        info!("abort pedido para el request {}", request_id);
        Ok(AbortResponse {
            request_id,
            abort_requested: true,
        })
    }

    /// Por defecto los más nuevos primero.
    pub fn list_requests(&self, query: &RequestListQuery) -> Result<Vec<RequestSummary>, ActionError> {
        let mut requests = self.db.get_requests()?;
        if !query.ascending.unwrap_or(false) {
            requests.reverse();
        }

        let mut out = Vec::new();
        for request in requests {
            if query.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let view = RequestView::load(self.db.as_ref(), request)?;
            let status = view.status();
            if query.status.is_some_and(|wanted| wanted != status) {
                continue;
            }
            out.push(RequestSummary {
                request_id: view.request.request_id,
                context: view.request.context.clone(),
                status,
                create_time: view.request.create_time,
                task_count: view.task_count(),
            });
        }
        Ok(out)
    }
}

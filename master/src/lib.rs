//! Master: planifica requests en stages, los persiste y los despacha a los agentes.

pub mod action_manager;
pub mod agents;
pub mod config;
pub mod custom_command;
pub mod db;
pub mod dispatch;
pub mod handlers;
pub mod monitor;
pub mod retry_policy;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use common::ClusterTopology;

use crate::action_manager::ActionManager;
use crate::agents::AgentRegistry;
use crate::config::{MasterConfig, StoreKind};
use crate::db::{ActionDbAccessor, FileActionDb, InMemoryActionDb};
use crate::dispatch::ReportQueue;
use crate::scheduler::ActionScheduler;
use crate::state::AppState;

/// Piezas del master ya conectadas entre sí.
pub struct Master {
    pub state: AppState,
    pub scheduler: Arc<ActionScheduler>,
    pub agents: Arc<AgentRegistry>,
}

pub fn open_store(config: &MasterConfig) -> Result<Arc<dyn ActionDbAccessor>> {
    let db: Arc<dyn ActionDbAccessor> = match config.store.kind {
        StoreKind::Memory => {
            warn!("store en memoria: los requests se pierden al reiniciar");
            Arc::new(InMemoryActionDb::new())
        }
        StoreKind::File => {
            let path = config
                .store
                .path
                .as_ref()
                .context("store.kind = file requiere store.path")?;
            info!("store en archivo {}", path.display());
            Arc::new(FileActionDb::open(path)?)
        }
    };
    Ok(db)
}

pub fn assemble(config: &MasterConfig) -> Result<Master> {
    let db = open_store(config)?;
    let topology = match config.load_topology()? {
        Some(t) => t,
        None => {
            warn!("sin cluster.topology_path: arrancando con un cluster vacío");
            ClusterTopology::new("default")
        }
    };
    assemble_with(config, db, topology)
}

/// Conecta scheduler, registro de agentes y fachada sobre un store y topología dados.
pub fn assemble_with(
    config: &MasterConfig,
    db: Arc<dyn ActionDbAccessor>,
    topology: ClusterTopology,
) -> Result<Master> {
    info!(
        "cluster {}: {} hosts, {} servicios",
        topology.cluster_name,
        topology.hosts.len(),
        topology.services.len()
    );
    let order = config.load_role_command_order()?;

    let agents = Arc::new(AgentRegistry::new(std::time::Duration::from_secs(
        config.agents.heartbeat_timeout_secs,
    )));
    let reports = ReportQueue::new();
    let actions = Arc::new(ActionManager::new(
        db.clone(),
        Arc::new(topology),
        Arc::new(order),
        config.scheduler.timeouts(),
    ));
    let scheduler = Arc::new(ActionScheduler::new(
        db,
        agents.clone(),
        reports.clone(),
        config.scheduler.clone(),
    ));

    Ok(Master {
        state: AppState::new(actions, agents.clone(), reports),
        scheduler,
        agents,
    })
}

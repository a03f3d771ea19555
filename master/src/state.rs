use std::sync::Arc;

use crate::action_manager::ActionManager;
use crate::agents::AgentRegistry;
use crate::dispatch::ReportQueue;

#[derive(Clone)]
pub struct AppState {
    pub actions: Arc<ActionManager>,
    pub agents: Arc<AgentRegistry>,
    // reportes de agentes que consume el scheduler
    pub reports: ReportQueue,
    pub heartbeat_interval_secs: u64,
}

impl AppState {
    pub fn new(actions: Arc<ActionManager>, agents: Arc<AgentRegistry>, reports: ReportQueue) -> Self {
        // los agentes laten bastante más seguido de lo que tarda en vencer el timeout
        let heartbeat_interval_secs = (agents.heartbeat_timeout().as_secs() / 3).max(1);
        AppState {
            actions,
            agents,
            reports,
            heartbeat_interval_secs,
        }
    }
}

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::agents::AgentRegistry;

/// Detecta hosts sin heartbeat. Las tareas que tenían en vuelo vencen por
/// timeout en el scheduler, acá sólo se corta el despacho hacia ellos.
pub async fn monitor_hosts(registry: Arc<AgentRegistry>, interval: Duration) {
    info!(
        "monitor de hosts cada {:?} (timeout de heartbeat {:?})",
        interval,
        registry.heartbeat_timeout()
    );
    loop {
        tokio::time::sleep(interval).await;
        let lost = registry.sweep(SystemTime::now());
        if !lost.is_empty() {
            debug!("hosts perdidos en esta pasada: {:?}", lost);
        }
    }
}

//! Registro de agentes: liveness por heartbeat, cola de comandos por host y métricas.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use common::{AgentCommand, HostMetrics, HostName, HostState};

use crate::dispatch::{AgentDispatcher, DispatchError, DispatchHandle};

#[derive(Debug, Clone)]
struct HostEntry {
    max_concurrency: u32,
    last_heartbeat: SystemTime,
    state: HostState,
    queue: VecDeque<AgentCommand>,

    // Métricas
    commands_dispatched: u64,
    reports_received: u64,
    last_cpu_percent: Option<f32>,
    last_mem_bytes: Option<u64>,
}

impl HostEntry {
    fn silence(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_heartbeat).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct AgentRegistry {
    hosts: Mutex<HashMap<HostName, HostEntry>>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        AgentRegistry {
            hosts: Mutex::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HostName, HostEntry>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registra (o re-registra) un host. Un re-registro descarta la cola vieja:
    /// el agente reinició y esos comandos vencerán por timeout.
    pub fn register(&self, host_name: &str, max_concurrency: u32) {
        let mut hosts = self.lock();
        let entry = HostEntry {
            max_concurrency: max_concurrency.max(1),
            last_heartbeat: SystemTime::now(),
            state: HostState::Healthy,
            queue: VecDeque::new(),
            commands_dispatched: 0,
            reports_received: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        };
        match hosts.insert(host_name.to_string(), entry) {
            Some(old) if !old.queue.is_empty() => warn!(
                "host {} se re-registró con {} comandos sin entregar",
                host_name,
                old.queue.len()
            ),
            Some(_) => info!("host {} re-registrado", host_name),
            None => info!("host {} registrado (max_concurrency={})", host_name, max_concurrency),
        }
    }

    /// Devuelve false si el host no está registrado.
    pub fn heartbeat(&self, host_name: &str, cpu_percent: Option<f32>, mem_bytes: Option<u64>) -> bool {
        let mut hosts = self.lock();
        let Some(entry) = hosts.get_mut(host_name) else {
            return false;
        };
        entry.last_heartbeat = SystemTime::now();
        entry.last_cpu_percent = cpu_percent;
        entry.last_mem_bytes = mem_bytes;
        if entry.state == HostState::HeartbeatLost {
            info!("host {} volvió a mandar heartbeats", host_name);
            entry.state = HostState::Healthy;
        }
        true
    }

    /// Entrega hasta `max` comandos encolados. None si el host no está registrado.
    pub fn take_commands(&self, host_name: &str, max: usize) -> Option<Vec<AgentCommand>> {
        let mut hosts = self.lock();
        let entry = hosts.get_mut(host_name)?;
        entry.last_heartbeat = SystemTime::now();
        let n = max.min(entry.queue.len());
        Some(entry.queue.drain(..n).collect())
    }

    pub fn note_reports(&self, host_name: &str, count: usize) -> bool {
        let mut hosts = self.lock();
        match hosts.get_mut(host_name) {
            Some(entry) => {
                entry.reports_received += count as u64;
                true
            }
            None => false,
        }
    }

    /// Marca como perdidos los hosts sin heartbeat. Devuelve los recién marcados.
    pub fn sweep(&self, now: SystemTime) -> Vec<HostName> {
        let mut lost = Vec::new();
        let mut hosts = self.lock();
        for (host, entry) in hosts.iter_mut() {
            if entry.state == HostState::HeartbeatLost {
                continue;
            }
            let silence = entry.silence(now);
            if silence > self.heartbeat_timeout {
                entry.state = HostState::HeartbeatLost;
                // sin entregar: vencen por timeout y el scheduler decide
                let dropped = entry.queue.len();
                entry.queue.clear();
                warn!(
                    "marcando host {} como HEARTBEAT_LOST (sin heartbeat hace {:?}, {} comandos descartados)",
                    host, silence, dropped
                );
                lost.push(host.clone());
            }
        }
        lost.sort();
        lost
    }

    pub fn metrics(&self) -> Vec<HostMetrics> {
        let now = SystemTime::now();
        let hosts = self.lock();
        let mut out: Vec<HostMetrics> = hosts
            .iter()
            .map(|(host, entry)| HostMetrics {
                host_name: host.clone(),
                state: entry.state,
                max_concurrency: entry.max_concurrency,
                last_heartbeat_secs_ago: entry.silence(now).as_secs(),
                queued_commands: entry.queue.len(),
                commands_dispatched: entry.commands_dispatched,
                reports_received: entry.reports_received,
                cpu_percent: entry.last_cpu_percent,
                mem_bytes: entry.last_mem_bytes,
            })
            .collect();
        out.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        out
    }
}

impl AgentDispatcher for AgentRegistry {
    fn dispatch(&self, host_name: &str, command: AgentCommand) -> Result<DispatchHandle, DispatchError> {
        let now = SystemTime::now();
        let mut hosts = self.lock();
        let entry = hosts
            .get_mut(host_name)
            .ok_or_else(|| DispatchError::HostNotRegistered(host_name.to_string()))?;

        let silence = entry.silence(now);
        if entry.state == HostState::HeartbeatLost || silence > self.heartbeat_timeout {
            return Err(DispatchError::HostUnreachable {
                host: host_name.to_string(),
                secs: silence.as_secs(),
            });
        }

        let handle = DispatchHandle {
            dispatch_id: command.dispatch_id.clone(),
            host_name: host_name.to_string(),
            task_id: command.task_id,
        };
        entry.commands_dispatched += 1;
        entry.queue.push_back(command);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CommandPayload, Role, RoleCommand};

    fn command(task_id: u64, host: &str) -> AgentCommand {
        AgentCommand {
            dispatch_id: format!("d-{}", task_id),
            task_id,
            request_id: 1,
            stage_id: 1,
            attempt: 1,
            host_name: host.to_string(),
            role: Role::new("DATANODE"),
            role_command: RoleCommand::Start,
            command_type: "START".into(),
            custom_command: None,
            payload: CommandPayload::default(),
            cluster_host_info: Default::default(),
            timeout_secs: 60,
        }
    }

    #[test]
    fn unknown_host_is_rejected() {
        let registry = AgentRegistry::new(Duration::from_secs(30));
        let err = registry.dispatch("h9", command(1, "h9")).unwrap_err();
        assert_eq!(err, DispatchError::HostNotRegistered("h9".into()));
        assert!(!registry.heartbeat("h9", None, None));
        assert!(registry.take_commands("h9", 5).is_none());
    }

    #[test]
    fn commands_are_delivered_in_order_up_to_max() {
        let registry = AgentRegistry::new(Duration::from_secs(30));
        registry.register("h1", 2);
        for id in 1..=3 {
            registry.dispatch("h1", command(id, "h1")).unwrap();
        }
        let first: Vec<_> = registry.take_commands("h1", 2).unwrap().iter().map(|c| c.task_id).collect();
        assert_eq!(first, vec![1, 2]);
        let rest = registry.take_commands("h1", 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(registry.metrics()[0].commands_dispatched, 3);
    }

    #[test]
    fn silent_host_is_marked_lost_and_recovers() {
        let registry = AgentRegistry::new(Duration::from_secs(30));
        registry.register("h1", 1);
        registry.dispatch("h1", command(1, "h1")).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(registry.sweep(later), vec!["h1".to_string()]);
        // una sola vez
        assert!(registry.sweep(later).is_empty());

        let metrics = registry.metrics();
        assert_eq!(metrics[0].state, HostState::HeartbeatLost);
        assert_eq!(metrics[0].queued_commands, 0);
        assert!(matches!(
            registry.dispatch("h1", command(2, "h1")),
            Err(DispatchError::HostUnreachable { .. })
        ));

        assert!(registry.heartbeat("h1", Some(12.5), Some(1024)));
        assert_eq!(registry.metrics()[0].state, HostState::Healthy);
        assert!(registry.dispatch("h1", command(2, "h1")).is_ok());
    }
}

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{
    AgentCommand, ClusterTopology, CommandReport, ComponentState, HostRoleCommand, ReportStatus,
};
use master::config::MasterConfig;
use master::db::{ActionDbAccessor, InMemoryActionDb};
use master::{assemble_with, Master};

pub const HOSTS: [&str; 3] = ["h1", "h2", "h3"];

pub fn topology() -> ClusterTopology {
    let mut topology = ClusterTopology::new("c1")
        .with_service("ZOOKEEPER", &["ZOOKEEPER_SERVER"])
        .with_service("HDFS", &["NAMENODE", "DATANODE"])
        .with_service("HBASE", &["HBASE_MASTER", "HBASE_REGIONSERVER"])
        .with_component("h1", "ZOOKEEPER_SERVER", ComponentState::Started)
        .with_component("h1", "NAMENODE", ComponentState::Started)
        .with_component("h1", "HBASE_MASTER", ComponentState::Installed)
        .with_component("h2", "DATANODE", ComponentState::Started)
        .with_component("h2", "HBASE_REGIONSERVER", ComponentState::Installed)
        .with_component("h3", "DATANODE", ComponentState::Started)
        .with_component("h3", "HBASE_REGIONSERVER", ComponentState::Installed);
    topology.desired_config_tags.insert("hbase-site".into(), "v1".into());
    topology
}

pub fn config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.scheduler.max_attempts = 2;
    config.scheduler.max_in_flight_per_host = 4;
    config
}

pub fn master_on(db: Arc<dyn ActionDbAccessor>) -> Master {
    assemble_with(&config(), db, topology()).expect("master")
}

pub fn master() -> (Arc<InMemoryActionDb>, Master) {
    let db = Arc::new(InMemoryActionDb::new());
    let master = master_on(db.clone());
    (db, master)
}

pub fn register_all(master: &Master) {
    for host in HOSTS {
        master.agents.register(host, 4);
    }
}

/// Lo que el agente de `host` tiene para ejecutar.
pub fn pull(master: &Master, host: &str) -> Vec<AgentCommand> {
    master.agents.take_commands(host, 16).unwrap_or_default()
}

pub fn pull_all(master: &Master) -> Vec<AgentCommand> {
    HOSTS.iter().flat_map(|h| pull(master, h)).collect()
}

pub fn report_for(command: &AgentCommand, status: ReportStatus) -> CommandReport {
    CommandReport {
        task_id: command.task_id,
        attempt: command.attempt,
        host_name: command.host_name.clone(),
        status,
        exit_code: match status {
            ReportStatus::Completed => Some(0),
            ReportStatus::Failed => Some(1),
            ReportStatus::InProgress => None,
        },
        stdout: format!("{} {}", command.role, command.command_type),
        stderr: String::new(),
    }
}

pub fn answer(master: &Master, commands: &[AgentCommand], status: ReportStatus) {
    master
        .state
        .reports
        .push_all(commands.iter().map(|c| report_for(c, status)));
}

pub fn tick(master: &Master) {
    master.scheduler.do_work().expect("do_work");
}

pub fn tick_at(master: &Master, now: DateTime<Utc>) {
    master.scheduler.do_work_at(now).expect("do_work");
}

pub fn task(db: &dyn ActionDbAccessor, task_id: u64) -> HostRoleCommand {
    db.get_task(task_id).unwrap().unwrap()
}

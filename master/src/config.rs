//! Configuración del master: defaults, archivo YAML opcional y variables `MASTER_*`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use common::{ClusterTopology, RoleCommandOrder, TimeoutDefaults};
use common::role_command_order::DEFAULT_SECTIONS;

pub const ENV_PREFIX: &str = "MASTER_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub kind: StoreKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            kind: StoreKind::Memory,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub sleep_time_ms: u64,
    /// Intentos contados por tarea antes de dejarla FAILED.
    pub max_attempts: u32,
    pub max_in_flight_per_host: usize,
    pub max_in_flight_total: usize,
    pub default_task_timeout_secs: u64,
    pub install_task_timeout_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            sleep_time_ms: 1000,
            max_attempts: 2,
            max_in_flight_per_host: 4,
            max_in_flight_total: 256,
            default_task_timeout_secs: 600,
            install_task_timeout_secs: 1800,
        }
    }
}

impl SchedulerSettings {
    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }

    pub fn timeouts(&self) -> TimeoutDefaults {
        TimeoutDefaults {
            default_secs: self.default_task_timeout_secs,
            install_secs: self.install_task_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub heartbeat_timeout_secs: u64,
    pub monitor_interval_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            heartbeat_timeout_secs: 30,
            monitor_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    /// JSON de role_command_order; si falta se usa el embebido.
    pub role_command_order_path: Option<PathBuf>,
    pub sections: Vec<String>,
}

impl Default for StackSettings {
    fn default() -> Self {
        StackSettings {
            role_command_order_path: None,
            sections: DEFAULT_SECTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub topology_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen_addr: String,
    pub store: StoreSettings,
    pub scheduler: SchedulerSettings,
    pub agents: AgentSettings,
    pub stack: StackSettings,
    pub cluster: ClusterSettings,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            listen_addr: "0.0.0.0:8080".to_string(),
            store: StoreSettings::default(),
            scheduler: SchedulerSettings::default(),
            agents: AgentSettings::default(),
            stack: StackSettings::default(),
            cluster: ClusterSettings::default(),
        }
    }
}

impl MasterConfig {
    fn base() -> Figment {
        Figment::from(Serialized::defaults(MasterConfig::default()))
    }

    /// defaults < archivo YAML < `MASTER_*` (ej: `MASTER_SCHEDULER__MAX_ATTEMPTS=3`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Self::base();
        if let Some(path) = path {
            if !path.exists() {
                bail!("no existe el archivo de configuración {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::finish(figment)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::finish(Self::base().merge(Yaml::string(yaml)))
    }

    fn finish(figment: Figment) -> Result<Self> {
        let config: MasterConfig = figment.extract().context("configuración inválida")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_socket()?;
        if self.scheduler.max_attempts < 1 {
            bail!("scheduler.max_attempts debe ser >= 1");
        }
        if self.scheduler.max_in_flight_per_host < 1 || self.scheduler.max_in_flight_total < 1 {
            bail!("los límites de concurrencia del scheduler deben ser >= 1");
        }
        if self.scheduler.sleep_time_ms == 0 {
            bail!("scheduler.sleep_time_ms debe ser > 0");
        }
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            bail!("store.kind = file requiere store.path");
        }
        if self.agents.heartbeat_timeout_secs == 0 || self.agents.monitor_interval_secs == 0 {
            bail!("los intervalos de agentes deben ser > 0");
        }
        Ok(())
    }

    pub fn listen_socket(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("listen_addr inválida: {}", self.listen_addr))
    }

    pub fn load_role_command_order(&self) -> Result<RoleCommandOrder> {
        let order = match &self.stack.role_command_order_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("leyendo {}", path.display()))?;
                RoleCommandOrder::from_json_str(&raw, &self.stack.sections)?
            }
            None => RoleCommandOrder::from_json_str(
                common::role_command_order::BUNDLED_ORDER,
                &self.stack.sections,
            )?,
        };
        Ok(order)
    }

    /// Topología desde YAML (o JSON). Sin path arranca un cluster vacío.
    pub fn load_topology(&self) -> Result<Option<ClusterTopology>> {
        let Some(path) = &self.cluster.topology_path else {
            return Ok(None);
        };
        let topology: ClusterTopology = Figment::from(Yaml::file(path))
            .extract()
            .with_context(|| format!("topología inválida en {}", path.display()))?;
        Ok(Some(normalize_topology(topology)))
    }
}

/// Todo host con componentes pertenece al cluster.
pub fn normalize_topology(mut topology: ClusterTopology) -> ClusterTopology {
    let placed: Vec<String> = topology.placements.keys().cloned().collect();
    topology.hosts.extend(placed);
    topology
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = MasterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_socket().unwrap().port(), 8080);
        assert_eq!(config.scheduler.max_attempts, 2);
        assert_eq!(config.scheduler.timeouts().install_secs, 1800);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let config = MasterConfig::from_yaml_str(
            r#"
listen_addr: "127.0.0.1:9090"
scheduler:
  max_attempts: 3
  sleep_time_ms: 250
store:
  kind: file
  path: /tmp/actions.json
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.sleep_time(), Duration::from_millis(250));
        // lo no mencionado conserva el default
        assert_eq!(config.scheduler.max_in_flight_per_host, 4);
        assert_eq!(config.store.kind, StoreKind::File);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(MasterConfig::from_yaml_str("scheduler:\n  max_attempts: 0\n").is_err());
        assert!(MasterConfig::from_yaml_str("listen_addr: nope\n").is_err());
        assert!(MasterConfig::from_yaml_str("store:\n  kind: file\n").is_err());
    }

    #[test]
    fn env_wins_over_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "master.yaml",
                "scheduler:\n  max_attempts: 3\ncluster:\n  topology_path: topology.yaml\n",
            )?;
            jail.create_file(
                "topology.yaml",
                r#"
cluster_name: c1
services:
  HDFS:
    components:
      DATANODE: {}
      NAMENODE:
        custom_commands: [DECOMMISSION]
placements:
  h1:
    NAMENODE: STARTED
  h2:
    DATANODE: INSTALLED
"#,
            )?;
            jail.set_env("MASTER_SCHEDULER__MAX_ATTEMPTS", "5");

            let config = MasterConfig::load(Some(Path::new("master.yaml"))).expect("config");
            assert_eq!(config.scheduler.max_attempts, 5);

            let topology = config.load_topology().expect("topology").expect("path");
            assert_eq!(topology.cluster_name, "c1");
            assert!(topology.has_host("h2"));
            Ok(())
        });
    }

    #[test]
    fn bundled_order_loads_with_default_sections() {
        let order = MasterConfig::default().load_role_command_order().unwrap();
        assert!(!order.is_empty());
    }
}

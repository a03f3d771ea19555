use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::role::{Role, RoleCommand};

pub type HostName = String;

/// `<rol>_hosts` -> hosts, más `all_hosts`. Se adjunta a requests, stages y comandos.
pub type ClusterHostInfo = BTreeMap<String, Vec<HostName>>;

/// Estado de ciclo de vida de un componente en un host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    #[default]
    Init,
    InstallFailed,
    Installed,
    Started,
    Unknown,
}

impl ComponentState {
    /// Si el comando tiene sentido en este estado.
    pub fn allows(&self, command: &RoleCommand) -> bool {
        use ComponentState::*;
        match command {
            RoleCommand::Install => matches!(self, Init | InstallFailed | Installed),
            RoleCommand::Start => matches!(self, Installed | Started),
            RoleCommand::Stop => matches!(self, Installed | Started),
            RoleCommand::Upgrade => matches!(self, Installed | Started),
            RoleCommand::ServiceCheck | RoleCommand::Execute => !matches!(self, Unknown),
            RoleCommand::CustomCommand(name) if name.eq_ignore_ascii_case(RoleCommand::RESTART) => {
                matches!(self, Installed | Started)
            }
            RoleCommand::CustomCommand(_) => matches!(self, Started | Installed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Comandos custom que el componente declara (ej: DECOMMISSION).
    #[serde(default)]
    pub custom_commands: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub components: BTreeMap<Role, ComponentInfo>,
}

/// Foto de sólo lectura del cluster: hosts, servicios y ubicación de componentes.
/// Se pasa explícitamente a quien la necesita.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub cluster_name: String,
    #[serde(default)]
    pub hosts: BTreeSet<HostName>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceInfo>,
    /// host -> (componente -> estado)
    #[serde(default)]
    pub placements: BTreeMap<HostName, BTreeMap<Role, ComponentState>>,
    /// tipo de config -> tag deseado (ej: "hdfs-site" -> "version3")
    #[serde(default)]
    pub desired_config_tags: BTreeMap<String, String>,
}

impl ClusterTopology {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        ClusterTopology {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: &str, components: &[&str]) -> Self {
        let info = self.services.entry(service.to_string()).or_default();
        for c in components {
            info.components.insert(Role::new(*c), ComponentInfo::default());
        }
        self
    }

    pub fn with_component(mut self, host: &str, role: &str, state: ComponentState) -> Self {
        self.hosts.insert(host.to_string());
        self.placements
            .entry(host.to_string())
            .or_default()
            .insert(Role::new(role), state);
        self
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    /// Servicio dueño de un componente, o del rol de service check.
    pub fn service_of(&self, role: &Role) -> Option<&str> {
        for (name, info) in &self.services {
            if info.components.contains_key(role) || *role == Role::service_check(name) {
                return Some(name.as_str());
            }
        }
        None
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.service_of(role).is_some()
            || self.placements.values().any(|p| p.contains_key(role))
    }

    pub fn component_state(&self, host: &str, role: &Role) -> Option<ComponentState> {
        self.placements.get(host).and_then(|p| p.get(role)).copied()
    }

    pub fn component_info(&self, service: &str, role: &Role) -> Option<&ComponentInfo> {
        self.services.get(service).and_then(|s| s.components.get(role))
    }

    /// Hosts donde está ubicado un componente.
    pub fn hosts_for_component(&self, role: &Role) -> Vec<HostName> {
        self.placements
            .iter()
            .filter(|(_, comps)| comps.contains_key(role))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Hosts que corren algún componente del servicio.
    pub fn hosts_for_service(&self, service: &str) -> Vec<HostName> {
        let Some(info) = self.services.get(service) else {
            return Vec::new();
        };
        self.placements
            .iter()
            .filter(|(_, comps)| comps.keys().any(|r| info.components.contains_key(r)))
            .map(|(host, _)| host.clone())
            .collect()
    }

    pub fn cluster_host_info(&self) -> ClusterHostInfo {
        let mut info = ClusterHostInfo::new();
        for (host, comps) in &self.placements {
            for role in comps.keys() {
                info.entry(format!("{}_hosts", role.as_str().to_lowercase()))
                    .or_default()
                    .push(host.clone());
            }
        }
        info.insert("all_hosts".to_string(), self.hosts.iter().cloned().collect());
        info
    }

    /// Tags de configuración resueltos con el formato que espera el agente.
    pub fn configuration_tags(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.desired_config_tags
            .iter()
            .map(|(config_type, tag)| {
                let mut m = BTreeMap::new();
                m.insert("tag".to_string(), tag.clone());
                (config_type.clone(), m)
            })
            .collect()
    }
}

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::role::{RoleCommand, RoleCommandPair};

/// Sección que siempre se carga.
pub const GENERAL_DEPS: &str = "general_deps";

/// Secciones opcionales activas en la tabla por defecto (HDFS como filesystem).
pub const DEFAULT_SECTIONS: &[&str] = &["optional_no_glusterfs"];

pub const BUNDLED_ORDER: &str = include_str!("../resources/role_command_order.json");

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("role_command_order no es JSON válido: {0}")]
    Json(#[from] serde_json::Error),
    #[error("falta la sección {0} en role_command_order")]
    MissingSection(String),
    #[error("entrada inválida {key}: {reason}")]
    InvalidEntry { key: String, reason: String },
}

/// Tabla de precedencia entre rol-comandos para un stack.
///
/// Se construye una vez y después sólo se consulta. Que un par no tenga entradas
/// significa que no tiene restricciones de orden.
#[derive(Debug, Clone, Default)]
pub struct RoleCommandOrder {
    // bloqueado -> bloqueadores
    blockers: HashMap<RoleCommandPair, BTreeSet<RoleCommandPair>>,
    // bloqueador -> bloqueados
    dependents: HashMap<RoleCommandPair, BTreeSet<RoleCommandPair>>,
}

impl RoleCommandOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tabla incluida en el binario, con `general_deps` + `DEFAULT_SECTIONS`.
    pub fn bundled_default() -> Result<Self, OrderError> {
        Self::from_json_str(BUNDLED_ORDER, DEFAULT_SECTIONS)
    }

    /// Carga `general_deps` más las secciones opcionales pedidas.
    pub fn from_json_str<S: AsRef<str>>(json: &str, sections: &[S]) -> Result<Self, OrderError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value, sections)
    }

    pub fn from_value<S: AsRef<str>>(value: &Value, sections: &[S]) -> Result<Self, OrderError> {
        let mut order = RoleCommandOrder::new();

        let general = value
            .get(GENERAL_DEPS)
            .ok_or_else(|| OrderError::MissingSection(GENERAL_DEPS.to_string()))?;
        order.load_section(general)?;

        for section in sections {
            let name = section.as_ref();
            let deps = value
                .get(name)
                .ok_or_else(|| OrderError::MissingSection(name.to_string()))?;
            order.load_section(deps)?;
        }

        Ok(order)
    }

    fn load_section(&mut self, section: &Value) -> Result<(), OrderError> {
        let entries = section.as_object().ok_or_else(|| OrderError::InvalidEntry {
            key: "<section>".to_string(),
            reason: "se esperaba un objeto".to_string(),
        })?;

        for (key, blockers) in entries {
            if key.starts_with("_comment") {
                continue;
            }
            let blocked: RoleCommandPair = key.parse().map_err(|reason| OrderError::InvalidEntry {
                key: key.clone(),
                reason,
            })?;
            let list = blockers.as_array().ok_or_else(|| OrderError::InvalidEntry {
                key: key.clone(),
                reason: "se esperaba una lista de bloqueadores".to_string(),
            })?;
            for blocker in list {
                let raw = blocker.as_str().ok_or_else(|| OrderError::InvalidEntry {
                    key: key.clone(),
                    reason: format!("bloqueador no es string: {}", blocker),
                })?;
                let blocker: RoleCommandPair =
                    raw.parse().map_err(|reason| OrderError::InvalidEntry {
                        key: key.clone(),
                        reason,
                    })?;
                self.add_dependency(blocked.clone(), blocker);
            }
        }
        Ok(())
    }

    /// `blocker` tiene que terminar antes de que empiece `blocked`.
    pub fn add_dependency(&mut self, blocked: RoleCommandPair, blocker: RoleCommandPair) {
        let blocked = RoleCommandPair::for_ordering(&blocked.role, &blocked.command);
        let blocker = RoleCommandPair::for_ordering(&blocker.role, &blocker.command);
        self.dependents
            .entry(blocker.clone())
            .or_default()
            .insert(blocked.clone());
        self.blockers.entry(blocked).or_default().insert(blocker);
    }

    pub fn with_dependency(mut self, blocked: &str, blocker: &str) -> Result<Self, OrderError> {
        let parse = |s: &str| {
            s.parse::<RoleCommandPair>()
                .map_err(|reason| OrderError::InvalidEntry {
                    key: s.to_string(),
                    reason,
                })
        };
        self.add_dependency(parse(blocked)?, parse(blocker)?);
        Ok(self)
    }

    /// Pares que tienen que ir antes de `pair`. Incluye INSTALL antes de START del mismo rol.
    pub fn predecessors(&self, pair: &RoleCommandPair) -> BTreeSet<RoleCommandPair> {
        let key = RoleCommandPair::for_ordering(&pair.role, &pair.command);
        let mut out = self.blockers.get(&key).cloned().unwrap_or_default();
        if key.command == RoleCommand::Start {
            out.insert(RoleCommandPair::new(key.role.clone(), RoleCommand::Install));
        }
        out
    }

    /// Pares que tienen que ir después de `pair`.
    pub fn successors(&self, pair: &RoleCommandPair) -> BTreeSet<RoleCommandPair> {
        let key = RoleCommandPair::for_ordering(&pair.role, &pair.command);
        let mut out = self.dependents.get(&key).cloned().unwrap_or_default();
        if key.command == RoleCommand::Install {
            out.insert(RoleCommandPair::new(key.role.clone(), RoleCommand::Start));
        }
        out
    }

    pub fn must_precede(&self, first: &RoleCommandPair, second: &RoleCommandPair) -> bool {
        let first = RoleCommandPair::for_ordering(&first.role, &first.command);
        self.predecessors(second).contains(&first)
    }

    /// Cantidad de pares con bloqueadores explícitos.
    pub fn len(&self) -> usize {
        self.blockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blockers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(s: &str) -> RoleCommandPair {
        s.parse().unwrap()
    }

    #[test]
    fn bundled_table_loads_and_merges_sections() {
        let order = RoleCommandOrder::bundled_default().unwrap();
        assert!(!order.is_empty());

        let hbase = order.predecessors(&pair("HBASE_MASTER-START"));
        // general_deps + optional_no_glusterfs
        assert!(hbase.contains(&pair("ZOOKEEPER_SERVER-START")));
        assert!(hbase.contains(&pair("NAMENODE-START")));
        assert!(hbase.contains(&pair("DATANODE-START")));

        assert!(order
            .successors(&pair("NAMENODE-START"))
            .contains(&pair("SECONDARY_NAMENODE-START")));
    }

    #[test]
    fn optional_sections_are_opt_in() {
        let json = r#"{
            "general_deps": {"_comment": "x", "B-START": ["A-START"]},
            "extra": {"C-START": ["B-START"]}
        }"#;
        let base = RoleCommandOrder::from_json_str::<&str>(json, &[]).unwrap();
        assert!(base.predecessors(&pair("C-START")).iter().all(|p| p.role.as_str() == "C"));

        let extended = RoleCommandOrder::from_json_str(json, &["extra"]).unwrap();
        assert!(extended.must_precede(&pair("B-START"), &pair("C-START")));

        assert!(matches!(
            RoleCommandOrder::from_json_str(json, &["missing"]),
            Err(OrderError::MissingSection(_))
        ));
    }

    #[test]
    fn install_precedes_start_of_same_role() {
        let order = RoleCommandOrder::new();
        assert!(order.must_precede(&pair("DATANODE-INSTALL"), &pair("DATANODE-START")));
        assert!(!order.must_precede(&pair("DATANODE-INSTALL"), &pair("NAMENODE-START")));
    }

    #[test]
    fn restart_uses_start_constraints() {
        let order = RoleCommandOrder::new()
            .with_dependency("HIVE_METASTORE-START", "MYSQL_SERVER-START")
            .unwrap();
        let restart_metastore = RoleCommandPair::new(
            "HIVE_METASTORE",
            RoleCommand::CustomCommand("RESTART".to_string()),
        );
        let restart_mysql = RoleCommandPair::new(
            "MYSQL_SERVER",
            RoleCommand::CustomCommand("RESTART".to_string()),
        );
        assert!(order.must_precede(&restart_mysql, &restart_metastore));
    }

    #[test]
    fn rejects_malformed_entries() {
        let json = r#"{"general_deps": {"B-START": "A-START"}}"#;
        assert!(matches!(
            RoleCommandOrder::from_json_str::<&str>(json, &[]),
            Err(OrderError::InvalidEntry { .. })
        ));
    }
}

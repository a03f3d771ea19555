use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identificador de componente, ej: "DATANODE", "HBASE_MASTER", "HDFS_SERVICE_CHECK".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Role(name.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rol sintético que ejecuta el service check de un servicio.
    pub fn service_check(service_name: &str) -> Self {
        Role::new(format!("{}_SERVICE_CHECK", service_name))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::new(s)
    }
}

/// Verbo aplicado a un rol. Los comandos custom llevan su nombre como payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleCommand {
    Install,
    Start,
    Stop,
    Upgrade,
    ServiceCheck,
    Execute,
    CustomCommand(String),
}

impl RoleCommand {
    pub const RESTART: &'static str = "RESTART";

    /// Comando usado para buscar en la tabla de orden.
    /// RESTART se ordena igual que START.
    pub fn ordering_command(&self) -> RoleCommand {
        match self {
            RoleCommand::CustomCommand(name) if name.eq_ignore_ascii_case(Self::RESTART) => {
                RoleCommand::Start
            }
            other => other.clone(),
        }
    }

    pub fn custom_name(&self) -> Option<&str> {
        match self {
            RoleCommand::CustomCommand(name) => Some(name),
            _ => None,
        }
    }

    /// Etiqueta de tipo que viaja al agente.
    pub fn kind(&self) -> &'static str {
        match self {
            RoleCommand::Install => "INSTALL",
            RoleCommand::Start => "START",
            RoleCommand::Stop => "STOP",
            RoleCommand::Upgrade => "UPGRADE",
            RoleCommand::ServiceCheck => "SERVICE_CHECK",
            RoleCommand::Execute => "EXECUTE",
            RoleCommand::CustomCommand(_) => "CUSTOM_COMMAND",
        }
    }
}

impl fmt::Display for RoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleCommand::CustomCommand(name) => write!(f, "CUSTOM_COMMAND({})", name),
            other => f.write_str(other.kind()),
        }
    }
}

impl FromStr for RoleCommand {
    type Err = String;

    /// Acepta los verbos de la tabla de orden ("START", "SERVICE_CHECK", ...).
    /// Cualquier otro nombre se interpreta como comando custom.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.as_str() {
            "" => Err("comando vacío".to_string()),
            "INSTALL" => Ok(RoleCommand::Install),
            "START" => Ok(RoleCommand::Start),
            "STOP" => Ok(RoleCommand::Stop),
            "UPGRADE" => Ok(RoleCommand::Upgrade),
            "SERVICE_CHECK" => Ok(RoleCommand::ServiceCheck),
            "EXECUTE" => Ok(RoleCommand::Execute),
            _ => Ok(RoleCommand::CustomCommand(upper)),
        }
    }
}

/// Par (rol, comando): unidad de la tabla de orden y nodo del grafo de roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleCommandPair {
    pub role: Role,
    pub command: RoleCommand,
}

impl RoleCommandPair {
    pub fn new(role: impl Into<Role>, command: RoleCommand) -> Self {
        RoleCommandPair {
            role: role.into(),
            command,
        }
    }

    /// Normaliza el comando para consultar la tabla de orden.
    pub fn for_ordering(role: &Role, command: &RoleCommand) -> Self {
        RoleCommandPair {
            role: role.clone(),
            command: command.ordering_command(),
        }
    }
}

impl fmt::Display for RoleCommandPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            RoleCommand::CustomCommand(name) => write!(f, "{}-{}", self.role, name),
            other => write!(f, "{}-{}", self.role, other.kind()),
        }
    }
}

impl FromStr for RoleCommandPair {
    type Err = String;

    /// Formato de la tabla: "DATANODE-START". El rol puede contener '_' pero no '-'.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, command) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("par rol-comando inválido: {}", s))?;
        if role.is_empty() {
            return Err(format!("par rol-comando sin rol: {}", s));
        }
        Ok(RoleCommandPair {
            role: Role::new(role),
            command: command.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_order_table_keys() {
        let pair: RoleCommandPair = "HBASE_MASTER-START".parse().unwrap();
        assert_eq!(pair.role, Role::new("HBASE_MASTER"));
        assert_eq!(pair.command, RoleCommand::Start);

        let check: RoleCommandPair = "HDFS_SERVICE_CHECK-SERVICE_CHECK".parse().unwrap();
        assert_eq!(check.role, Role::service_check("HDFS"));
        assert_eq!(check.command, RoleCommand::ServiceCheck);

        assert!("NOSEPARATOR".parse::<RoleCommandPair>().is_err());
        assert!("-START".parse::<RoleCommandPair>().is_err());
    }

    #[test]
    fn restart_is_ordered_like_start() {
        let restart = RoleCommand::CustomCommand("restart".to_string());
        assert_eq!(restart.ordering_command(), RoleCommand::Start);

        let decom = RoleCommand::CustomCommand("DECOMMISSION".to_string());
        assert_eq!(decom.ordering_command(), decom);
    }

    #[test]
    fn role_command_serializes_as_tagged_union() {
        let json = serde_json::to_value(RoleCommand::CustomCommand("REBALANCEHDFS".into())).unwrap();
        assert_eq!(json["type"], "CUSTOM_COMMAND");
        assert_eq!(json["name"], "REBALANCEHDFS");

        let back: RoleCommand = serde_json::from_value(serde_json::json!({"type": "START"})).unwrap();
        assert_eq!(back, RoleCommand::Start);
    }
}

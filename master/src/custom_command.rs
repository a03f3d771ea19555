//! Expansión de acciones de alto nivel (service checks, RESTART, comandos
//! custom de componentes) a un stage candidato.

use std::collections::BTreeMap;

use common::{
    ClusterTopology, CommandPayload, CommandSpec, ComponentState, ExecuteActionRequest, HostName,
    PlanError, ResourceFilter, Role, RoleCommand, StagePlan,
};

pub const SERVICE_CHECK_COMMAND: &str = "SERVICE_CHECK";
/// Nombre del comando custom en `command_params`.
pub const CUSTOM_COMMAND_PARAM: &str = "custom_command";

fn is_service_check(command: &str) -> bool {
    command == SERVICE_CHECK_COMMAND || command.ends_with("_SERVICE_CHECK")
}

/// Arma el stage candidato de una acción. No toca el store.
pub fn expand_action(
    topology: &ClusterTopology,
    request: &ExecuteActionRequest,
) -> Result<StagePlan, PlanError> {
    let command = request.command_name.trim().to_uppercase();
    if command.is_empty() {
        return Err(PlanError::validation("la acción no tiene command_name"));
    }
    if request.resource_filters.is_empty() {
        return Err(PlanError::validation(format!(
            "la acción {} necesita al menos un resource filter",
            command
        )));
    }

    let context = request
        .context
        .clone()
        .unwrap_or_else(|| format!("Execute {}", command));
    let mut stage = StagePlan::new(context);

    for filter in &request.resource_filters {
        let service = filter.service_name.trim().to_uppercase();
        if service.is_empty() {
            return Err(PlanError::validation("resource filter sin service_name"));
        }
        if !topology.services.contains_key(&service) {
            return Err(PlanError::validation(format!(
                "el servicio {} no existe en el cluster {}",
                service, topology.cluster_name
            )));
        }

        let commands = if is_service_check(&command) {
            vec![service_check(topology, &service, filter, request)?]
        } else {
            component_commands(topology, &service, &command, filter, request)?
        };
        for spec in commands {
            stage = stage.with_command(spec);
        }
    }
    Ok(stage)
}

fn payload(
    topology: &ClusterTopology,
    service: &str,
    request: &ExecuteActionRequest,
    custom: Option<&str>,
) -> CommandPayload {
    let mut command_params: BTreeMap<String, String> = request.parameters.clone();
    if let Some(name) = custom {
        command_params.insert(CUSTOM_COMMAND_PARAM.to_string(), name.to_string());
    }
    CommandPayload {
        service_name: Some(service.to_string()),
        command_params,
        role_params: BTreeMap::new(),
        configuration_tags: topology.configuration_tags(),
    }
}

/// Un solo host corre el chequeo: el pedido, o el primero con algún componente
/// del servicio arrancado.
fn service_check(
    topology: &ClusterTopology,
    service: &str,
    filter: &ResourceFilter,
    request: &ExecuteActionRequest,
) -> Result<CommandSpec, PlanError> {
    let candidates = topology.hosts_for_service(service);
    let host: HostName = match filter.hosts.first() {
        Some(host) => {
            if !candidates.contains(host) {
                return Err(PlanError::validation(format!(
                    "el host {} no corre componentes de {}",
                    host, service
                )));
            }
            host.clone()
        }
        None => {
            let started = candidates.iter().find(|h| {
                topology
                    .placements
                    .get(*h)
                    .map(|comps| {
                        comps.iter().any(|(role, state)| {
                            *state == ComponentState::Started
                                && topology.service_of(role) == Some(service)
                        })
                    })
                    .unwrap_or(false)
            });
            started
                .or_else(|| candidates.first())
                .cloned()
                .ok_or_else(|| {
                    PlanError::validation(format!("no hay hosts para el service check de {}", service))
                })?
        }
    };

    let mut spec = CommandSpec::new(host, Role::service_check(service), RoleCommand::ServiceCheck)
        .with_payload(payload(topology, service, request, None));
    spec.command_detail = Some(format!("{} {}", service, SERVICE_CHECK_COMMAND));
    Ok(spec)
}

fn component_commands(
    topology: &ClusterTopology,
    service: &str,
    command: &str,
    filter: &ResourceFilter,
    request: &ExecuteActionRequest,
) -> Result<Vec<CommandSpec>, PlanError> {
    let component = filter
        .component_name
        .as_deref()
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            PlanError::validation(format!("el comando {} necesita component_name", command))
        })?;
    let role = Role::new(component.as_str());
    let info = topology.component_info(service, &role).ok_or_else(|| {
        PlanError::validation(format!("el componente {} no pertenece a {}", component, service))
    })?;

    let role_command: RoleCommand = command.parse().map_err(PlanError::validation)?;
    if let RoleCommand::CustomCommand(name) = &role_command {
        let declared = name == RoleCommand::RESTART
            || info.custom_commands.iter().any(|c| c.eq_ignore_ascii_case(name));
        if !declared {
            return Err(PlanError::validation(format!(
                "el componente {} no soporta el comando {}",
                component, name
            )));
        }
    }

    let hosts = if filter.hosts.is_empty() {
        topology.hosts_for_component(&role)
    } else {
        filter.hosts.clone()
    };
    if hosts.is_empty() {
        return Err(PlanError::validation(format!(
            "el componente {} no está en ningún host",
            component
        )));
    }

    let mut specs = Vec::with_capacity(hosts.len());
    for host in hosts {
        let state = topology.component_state(&host, &role).ok_or_else(|| {
            PlanError::validation(format!("el componente {} no está en el host {}", component, host))
        })?;
        if !state.allows(&role_command) {
            return Err(PlanError::validation(format!(
                "no se puede ejecutar {} sobre {} en {} (estado {:?})",
                command, component, host, state
            )));
        }
        let mut spec = CommandSpec::new(host, role.clone(), role_command.clone()).with_payload(
            payload(topology, service, request, role_command.custom_name()),
        );
        spec.command_detail = Some(format!("{} {}", command, component));
        specs.push(spec);
    }
    Ok(specs)
}

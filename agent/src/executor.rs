//! Ejecución local de un comando recibido del master.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use common::{AgentCommand, CommandReport, ReportStatus};

/// Script a correr con `sh -c`. Sin él el comando se simula.
pub const SCRIPT_PARAM: &str = "script";
/// Exit code que se reporta cuando el comando supera su timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: ReportStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Outcome {
    pub fn into_report(self, command: &AgentCommand) -> CommandReport {
        CommandReport {
            task_id: command.task_id,
            attempt: command.attempt,
            host_name: command.host_name.clone(),
            status: self.status,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Reporte de progreso que se manda al empezar.
pub fn started_report(command: &AgentCommand) -> CommandReport {
    Outcome {
        status: ReportStatus::InProgress,
        exit_code: None,
        stdout: format!("{} {} arrancó", command.role, command.command_type),
        stderr: String::new(),
    }
    .into_report(command)
}

pub async fn execute(command: &AgentCommand) -> Outcome {
    let Some(script) = command.payload.command_params.get(SCRIPT_PARAM) else {
        debug!("tarea {} sin script, simulando {}", command.task_id, command.command_type);
        return Outcome {
            status: ReportStatus::Completed,
            exit_code: Some(0),
            stdout: format!(
                "{} {} simulado en {}",
                command.role,
                command.custom_command.as_deref().unwrap_or(&command.command_type),
                command.host_name
            ),
            stderr: String::new(),
        };
    };
    run_script(script, Duration::from_secs(command.timeout_secs.max(1))).await
}

pub async fn run_script(script: &str, limit: Duration) -> Outcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(e) => {
            warn!("no se pudo lanzar el script: {}", e);
            return Outcome {
                status: ReportStatus::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            };
        }
    };

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let code = output.status.code();
            Outcome {
                status: if output.status.success() {
                    ReportStatus::Completed
                } else {
                    ReportStatus::Failed
                },
                exit_code: code,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
        }
        Ok(Err(e)) => Outcome {
            status: ReportStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: e.to_string(),
        },
        // el future se descarta y kill_on_drop mata el proceso
        Err(_) => Outcome {
            status: ReportStatus::Failed,
            exit_code: Some(TIMEOUT_EXIT_CODE),
            stdout: String::new(),
            stderr: format!("timeout después de {:?}", limit),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CommandPayload, Role, RoleCommand};

    fn command(script: Option<&str>) -> AgentCommand {
        let mut payload = CommandPayload::default();
        if let Some(s) = script {
            payload.command_params.insert(SCRIPT_PARAM.into(), s.into());
        }
        AgentCommand {
            dispatch_id: "d".into(),
            task_id: 3,
            request_id: 1,
            stage_id: 1,
            attempt: 2,
            host_name: "h1".into(),
            role: Role::new("DATANODE"),
            role_command: RoleCommand::Start,
            command_type: "START".into(),
            custom_command: None,
            payload,
            cluster_host_info: Default::default(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn missing_script_is_simulated() {
        let cmd = command(None);
        let report = execute(&cmd).await.into_report(&cmd);
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.attempt, 2);
        assert!(report.stdout.contains("DATANODE"));
    }

    #[tokio::test]
    async fn script_output_and_exit_code_are_captured() {
        let ok = execute(&command(Some("echo hola"))).await;
        assert_eq!(ok.status, ReportStatus::Completed);
        assert_eq!(ok.stdout.trim(), "hola");

        let failed = execute(&command(Some("echo malo >&2; exit 3"))).await;
        assert_eq!(failed.status, ReportStatus::Failed);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.stderr.trim(), "malo");
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let out = run_script("sleep 5", Duration::from_millis(200)).await;
        assert_eq!(out.status, ReportStatus::Failed);
        assert_eq!(out.exit_code, Some(TIMEOUT_EXIT_CODE));
    }
}

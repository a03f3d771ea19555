use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use common::{
    AbortResponse, ErrorBody, ExecuteActionRequest, HostMetrics, RequestStatus,
    RequestStatusReport, RequestSummary, ResourceFilter, SubmitRequest, SubmitResponse,
};

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar y seguir requests del master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un request armado a mano (JSON con context y stages)
    Submit {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long, default_value = "default")]
        cluster: String,
    },
    /// Ejecuta una acción: SERVICE_CHECK, RESTART o un comando custom
    Action {
        #[arg(value_name = "COMANDO")]
        command: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        component: Option<String>,
        /// Hosts separados por coma; vacío = todos
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,
        #[arg(long)]
        context: Option<String>,
        /// Parámetros clave=valor
        #[arg(long = "param", value_name = "CLAVE=VALOR")]
        params: Vec<String>,
        #[arg(long, default_value = "default")]
        cluster: String,
    },
    /// Consulta el estado de un request
    Status {
        #[arg(value_name = "REQUEST_ID")]
        id: u64,
        /// Repite la consulta hasta que el request termine
        #[arg(long)]
        watch: bool,
    },
    /// Pide abortar un request
    Abort {
        #[arg(value_name = "REQUEST_ID")]
        id: u64,
    },
    /// Lista requests
    Requests {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        ascending: bool,
    },
    /// Hosts registrados y sus métricas
    Hosts,
}

fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("parámetro inválido {:?}, se espera CLAVE=VALOR", p))
        })
        .collect()
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("master respondió {}: {}", status, body.error),
        Err(_) => bail!("master respondió {}", status),
    }
}

fn print_report(report: &RequestStatusReport) {
    println!("Request {}:", report.request_id);
    println!("  cluster : {}", report.cluster_name);
    println!("  contexto: {}", report.context);
    println!("  estado  : {}", report.status);
    if report.abort_requested {
        println!("  (abort pedido)");
    }
    println!("  progreso: {:.1}%", report.progress_percent);
    println!("  stages  : {}, tareas: {}", report.stage_count, report.task_count);
    for t in &report.tasks {
        println!(
            "    [{}] stage {} {} {} en {} -> {} (intentos={}, exit={:?})",
            t.task_id, t.stage_id, t.role, t.role_command, t.host_name, t.status, t.attempt_count, t.exit_code
        );
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit { file, cluster } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("leyendo {}", file.display()))?;
            let req: SubmitRequest = serde_json::from_str(&raw)
                .with_context(|| format!("{} no es un request válido", file.display()))?;
            let url = format!("{}/api/v1/clusters/{}/requests", base_url, cluster);
            let resp: SubmitResponse = decode(client.post(&url).json(&req).send().await?).await?;
            println!(
                "Request {} creado: {} stages, {} tareas",
                resp.request_id, resp.stage_count, resp.task_count
            );
        }

        Commands::Action {
            command,
            service,
            component,
            hosts,
            context,
            params,
            cluster,
        } => {
            let req = ExecuteActionRequest {
                command_name: command,
                context,
                resource_filters: vec![ResourceFilter {
                    service_name: service,
                    component_name: component,
                    hosts,
                }],
                parameters: parse_params(&params)?,
            };
            let url = format!("{}/api/v1/clusters/{}/actions", base_url, cluster);
            let resp: SubmitResponse = decode(client.post(&url).json(&req).send().await?).await?;
            println!("Acción enviada como request {} ({} tareas)", resp.request_id, resp.task_count);
        }

        Commands::Status { id, watch } => {
            let url = format!("{}/api/v1/requests/{}", base_url, id);
            loop {
                let report: RequestStatusReport = decode(client.get(&url).send().await?).await?;
                print_report(&report);
                if !watch || report.status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        Commands::Abort { id } => {
            let url = format!("{}/api/v1/requests/{}/abort", base_url, id);
            let resp: AbortResponse = decode(client.post(&url).send().await?).await?;
            if resp.abort_requested {
                println!("Abort pedido para el request {}", resp.request_id);
            } else {
                println!("El request {} ya había terminado", resp.request_id);
            }
        }

        Commands::Requests {
            status,
            limit,
            ascending,
        } => {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(s) = status {
                let parsed: RequestStatus = s.parse().map_err(|e| anyhow!("{}", e))?;
                query.push(("status", parsed.as_str().to_string()));
            }
            if let Some(l) = limit {
                query.push(("limit", l.to_string()));
            }
            query.push(("ascending", ascending.to_string()));

            let url = format!("{}/api/v1/requests", base_url);
            let requests: Vec<RequestSummary> =
                decode(client.get(&url).query(&query).send().await?).await?;
            if requests.is_empty() {
                println!("No hay requests.");
            }
            for r in requests {
                println!(
                    "{:>6}  {:<14} tareas={:<4} {}  {}",
                    r.request_id, r.status, r.task_count, r.create_time, r.context
                );
            }
        }

        Commands::Hosts => {
            let url = format!("{}/api/v1/hosts", base_url);
            let hosts: Vec<HostMetrics> = decode(client.get(&url).send().await?).await?;
            if hosts.is_empty() {
                println!("No hay hosts registrados.");
            }
            for h in hosts {
                println!("Host {}", h.host_name);
                println!("  estado         : {:?}", h.state);
                println!("  last_heartbeat : {} s ago", h.last_heartbeat_secs_ago);
                println!("  concurrency    : max={}", h.max_concurrency);
                println!(
                    "  comandos       : encolados={}, despachados={}, reportes={}",
                    h.queued_commands, h.commands_dispatched, h.reports_received
                );
                if let Some(cpu) = h.cpu_percent {
                    println!("  cpu            : {:.1}%", cpu);
                }
                if let Some(mem) = h.mem_bytes {
                    println!("  mem            : {} MB", mem / (1024 * 1024));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_as_key_value() {
        let params = parse_params(&["a=1".into(), "script=echo x=y".into()]).unwrap();
        assert_eq!(params["a"], "1");
        assert_eq!(params["script"], "echo x=y");
        assert!(parse_params(&["sin_igual".into()]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

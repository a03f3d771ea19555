use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use reqwest::{Client, StatusCode};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::{
    AgentHeartbeatRequest, AgentRegisterRequest, AgentRegisterResponse, CommandReport,
    CommandsRequest, CommandsResponse, ReportsRequest, ReportsResponse,
};

use crate::executor;

const DEFAULT_AGENT_CONCURRENCY: u32 = 2;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub master_url: String,
    pub host_name: String,
    pub max_concurrency: u32,
}

impl AgentConfig {
    /// `MASTER_URL`, `AGENT_HOSTNAME` y `AGENT_CONCURRENCY`.
    pub fn from_env() -> Self {
        let master_url =
            std::env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let host_name = std::env::var("AGENT_HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });
        let max_concurrency = std::env::var("AGENT_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_AGENT_CONCURRENCY);
        AgentConfig {
            master_url: master_url.trim_end_matches('/').to_string(),
            host_name,
            max_concurrency,
        }
    }
}

/// Reportes que todavía no llegaron al master.
#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<CommandReport>>>);

impl Outbox {
    fn push(&self, report: CommandReport) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(report);
    }

    fn take(&self) -> Vec<CommandReport> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn restore(&self, mut reports: Vec<CommandReport>) {
        let mut pending = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        reports.append(&mut pending);
        *pending = reports;
    }
}

pub struct Agent {
    config: AgentConfig,
    client: Client,
    outbox: Outbox,
    slots: Arc<Semaphore>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency as usize));
        Agent {
            config,
            client: Client::new(),
            outbox: Outbox::default(),
            slots,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/agents/{}", self.config.master_url, path)
    }

    async fn register(&self) -> Result<Duration> {
        let resp: AgentRegisterResponse = self
            .client
            .post(self.url("register"))
            .json(&AgentRegisterRequest {
                host_name: self.config.host_name.clone(),
                max_concurrency: self.config.max_concurrency,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(
            "agente {} registrado contra {} (concurrency={}, heartbeat cada {}s)",
            self.config.host_name,
            self.config.master_url,
            self.config.max_concurrency,
            resp.heartbeat_interval_secs
        );
        Ok(Duration::from_secs(resp.heartbeat_interval_secs.max(1)))
    }

    /// Devuelve false si el master no conoce al host.
    async fn heartbeat(&self, sys: &mut System) -> Result<bool> {
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let resp = self
            .client
            .post(self.url("heartbeat"))
            .json(&AgentHeartbeatRequest {
                host_name: self.config.host_name.clone(),
                cpu_percent: Some(cpu_percent),
                mem_bytes: Some(mem_bytes),
            })
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }

    async fn flush_reports(&self) -> Result<()> {
        let reports = self.outbox.take();
        if reports.is_empty() {
            return Ok(());
        }
        let count = reports.len();
        let sent = self
            .client
            .post(self.url("reports"))
            .json(&ReportsRequest {
                host_name: self.config.host_name.clone(),
                reports: reports.clone(),
            })
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match sent {
            Ok(resp) => {
                let ack: ReportsResponse = resp.json().await?;
                debug!("{} de {} reportes aceptados", ack.accepted, count);
                Ok(())
            }
            Err(e) => {
                self.outbox.restore(reports);
                bail!("no se pudieron enviar {} reportes: {}", count, e);
            }
        }
    }

    /// Pide comandos para los slots libres y lanza cada uno en su propia tarea.
    async fn pull_and_run(&self) -> Result<usize> {
        let free = self.slots.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let resp = self
            .client
            .post(self.url("commands"))
            .json(&CommandsRequest {
                host_name: self.config.host_name.clone(),
                max_commands: free as u32,
            })
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            bail!("el master no reconoce al host {}", self.config.host_name);
        }
        let CommandsResponse { commands } = resp.error_for_status()?.json().await?;
        let count = commands.len();

        for command in commands {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                // no debería pasar: se pidieron sólo los slots libres
                warn!("sin slot para la tarea {}, queda para el timeout", command.task_id);
                continue;
            };
            info!(
                "ejecutando tarea {} ({} {}, intento {})",
                command.task_id, command.role, command.command_type, command.attempt
            );
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                outbox.push(executor::started_report(&command));
                let outcome = executor::execute(&command).await;
                info!("tarea {} terminó: {:?}", command.task_id, outcome.status);
                outbox.push(outcome.into_report(&command));
                drop(permit);
            });
        }
        Ok(count)
    }

    pub async fn run(self) -> Result<()> {
        let mut heartbeat_every = loop {
            match self.register().await {
                Ok(interval) => break interval,
                Err(e) => {
                    warn!("no se pudo registrar el agente: {}, reintentando", e);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        };

        // System para leer CPU y memoria
        let mut sys = System::new_all();
        let mut last_heartbeat = Instant::now();

        loop {
            if last_heartbeat.elapsed() >= heartbeat_every {
                match self.heartbeat(&mut sys).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("el master olvidó al host, registrando de nuevo");
                        if let Ok(interval) = self.register().await {
                            heartbeat_every = interval;
                        }
                    }
                    Err(e) => warn!("heartbeat falló: {}", e),
                }
                last_heartbeat = Instant::now();
            }

            if let Err(e) = self.flush_reports().await {
                warn!("{}", e);
            }

            match self.pull_and_run().await {
                Ok(0) => {}
                Ok(n) => debug!("{} comandos recibidos", n),
                Err(e) => warn!("error pidiendo comandos: {}", e),
            }

            sleep(POLL_INTERVAL).await;
        }
    }
}

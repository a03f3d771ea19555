use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use master::config::MasterConfig;
use master::{assemble, handlers, monitor, scheduler};

#[derive(Parser, Debug)]
#[command(name = "master", about = "Scheduler de acciones del cluster")]
struct Args {
    /// Archivo YAML de configuración
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info,axum=info")),
        )
        .init();

    let args = Args::parse();
    let config = MasterConfig::load(args.config.as_deref())?;
    let master = assemble(&config)?;

    // scheduler en segundo plano
    tokio::spawn(scheduler::run_scheduler_loop(master.scheduler.clone()));

    // monitor de heartbeats en segundo plano
    tokio::spawn(monitor::monitor_hosts(
        master.agents.clone(),
        Duration::from_secs(config.agents.monitor_interval_secs),
    ));

    let app = handlers::build_router(master.state);
    let listener = TcpListener::bind(config.listen_socket()?).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

mod agent;
mod executor;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::agent::{Agent, AgentConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agent=debug,reqwest=info")),
        )
        .init();

    Agent::new(AgentConfig::from_env()).run().await
}

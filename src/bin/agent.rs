//! TripWire agent daemon
//!
//! Loads the YAML config, starts the watchers, the durable queue, the
//! audit log, and the dashboard transport, and serves /healthz until a
//! shutdown signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tripwire::agent::{health_router, Agent};
use tripwire::config::AgentConfig;

#[derive(Parser)]
#[command(name = "tripwire-agent")]
#[command(author = "TripWire Team")]
#[command(version)]
#[command(about = "Host intrusion detection agent")]
struct Cli {
    /// Configuration file path (.yaml)
    #[arg(short, long, env = "TRIPWIRE_CONFIG", default_value = "tripwire.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tripwire={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        rules = config.rules.len(),
        "tripwire agent starting"
    );

    let mut agent = Agent::new(&config).context("initialize agent")?;
    agent.start().await.context("start agent")?;

    // Health endpoint runs until the process exits.
    let health = health_router(agent.health_state());
    let health_addr = config.health_addr.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&health_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %health_addr, error = %e, "health listener bind failed");
                return;
            }
        };
        info!(addr = %health_addr, "health endpoint listening");
        if let Err(e) = axum::serve(listener, health).await {
            error!(error = %e, "health server exited");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    agent.stop().await;
    Ok(())
}

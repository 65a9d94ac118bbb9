//! TripWire dashboard collector
//!
//! Accepts mutually authenticated agent connections, validates and
//! persists their alerts, and fans them out to live subscribers.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tripwire::pb::alert_service_server::AlertServiceServer;
use tripwire::server::broadcaster::Broadcaster;
use tripwire::server::service::{AlertIngest, DEFAULT_MAX_EVENT_AGE_SECS};
use tripwire::server::storage::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "tripwire-server")]
#[command(author = "TripWire Team")]
#[command(version)]
#[command(about = "Alert collector for TripWire agents")]
struct Cli {
    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:4443")]
    listen: SocketAddr,

    /// Alert database path
    #[arg(long, default_value = "tripwire-server.db")]
    db: PathBuf,

    /// PEM server certificate
    #[arg(long, required_unless_present = "insecure")]
    cert: Option<PathBuf>,

    /// PEM server private key
    #[arg(long, required_unless_present = "insecure")]
    key: Option<PathBuf>,

    /// PEM CA certificate; client certificates must chain to it
    #[arg(long, required_unless_present = "insecure")]
    ca: Option<PathBuf>,

    /// Accept plaintext connections (local development only)
    #[arg(long)]
    insecure: bool,

    /// Reject events older than this many seconds
    #[arg(long, default_value_t = DEFAULT_MAX_EVENT_AGE_SECS)]
    max_event_age: i64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tripwire={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&cli.db).with_context(|| format!("open {}", cli.db.display()))?);
    let broadcaster = Arc::new(Broadcaster::new());

    // A log subscriber gives operators a live tail of everything ingested.
    let (_sub, mut alerts) = broadcaster.subscribe();
    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            info!(
                alert_id = %alert.alert_id,
                host = %alert.hostname,
                rule = %alert.rule_name,
                severity = %alert.severity,
                tripwire_type = %alert.tripwire_type,
                "alert"
            );
        }
    });

    let service = AlertIngest::with_max_age(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        cli.max_event_age,
    );

    let mut builder = tonic::transport::Server::builder();
    if cli.insecure {
        warn!("TLS disabled; agent connections are unauthenticated");
    } else {
        let tls = tripwire::server::tls_config(
            cli.cert.as_deref().context("--cert is required")?,
            cli.key.as_deref().context("--key is required")?,
            cli.ca.as_deref().context("--ca is required")?,
        )
        .context("load TLS material")?;
        builder = builder.tls_config(tls).context("apply TLS config")?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cli.listen,
        db = %cli.db.display(),
        mtls = !cli.insecure,
        "tripwire server starting"
    );

    builder
        .add_service(AlertServiceServer::new(service))
        .serve_with_shutdown(cli.listen, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serve gRPC")?;

    broadcaster.close();
    Ok(())
}

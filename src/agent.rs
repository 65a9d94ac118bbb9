//! Agent orchestrator
//!
//! Wires the watchers to the durable queue, the audit log, and the
//! transport. One dispatch task per watcher reads its event channel and,
//! for each event, appends to the audit log, enqueues, and offers the
//! event to the live send path. Per-watcher ordering is preserved; there
//! is no ordering across watchers.
//!
//! Shutdown is cooperative and ordered: watchers stop first (closing
//! their channels), dispatchers drain and exit, then the transport stops
//! and the queue closes, so no event is dropped mid-flight.

use crate::alert::TripwireType;
use crate::audit::AuditLog;
use crate::config::AgentConfig;
use crate::error::{Result, TripwireError};
use crate::queue::{AlertQueue, QueuedAlert};
use crate::transport::{
    GrpcTransport, TransportConfig, TransportCounters, TransportHandle, TransportTls,
};
use crate::watcher::file::FileWatcher;
use crate::watcher::network::NetworkWatcher;
use crate::watcher::process::ProcessWatcher;
use crate::watcher::Watcher;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Detected hostname, used as the agent's registration identity
pub fn detect_hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Shared state behind the /healthz endpoint
#[derive(Clone)]
pub struct HealthState {
    queue: Arc<AlertQueue>,
    counters: Arc<TransportCounters>,
    conn_state: watch::Receiver<crate::transport::ConnState>,
    started: Instant,
    /// Micros since epoch of the most recent dispatched alert; 0 = none
    last_alert_us: Arc<AtomicI64>,
}

async fn healthz(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let last_us = state.last_alert_us.load(Ordering::Relaxed);
    let last_alert_at = (last_us > 0)
        .then(|| Utc.timestamp_micros(last_us).single())
        .flatten()
        .map(|t| t.to_rfc3339());

    Json(json!({
        "status": "ok",
        "uptime_s": state.started.elapsed().as_secs(),
        "queue_depth": state.queue.depth(),
        "last_alert_at": last_alert_at,
        "transport_state": state.conn_state.borrow().as_str(),
        "alerts_sent_total": state.counters.alerts_sent_total.load(Ordering::Relaxed),
        "reconnect_total": state.counters.reconnect_total.load(Ordering::Relaxed),
    }))
}

/// Router exposing agent liveness and delivery counters
pub fn health_router(state: HealthState) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}

/// The running agent
pub struct Agent {
    queue: Arc<AlertQueue>,
    audit: Arc<AuditLog>,
    transport: GrpcTransport,
    watchers: Vec<Box<dyn Watcher>>,
    dispatchers: Vec<JoinHandle<()>>,
    started: Instant,
    last_alert_us: Arc<AtomicI64>,
}

impl Agent {
    /// Build all components from config. Nothing runs until `start`.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let queue = Arc::new(AlertQueue::open(&config.queue_path)?);
        let audit = Arc::new(AuditLog::open(&config.audit_path)?);

        let hostname = detect_hostname();
        let mut transport_config = TransportConfig::new(&config.dashboard_addr, hostname);
        transport_config.agent_version = config.agent_version.clone();
        transport_config.tls = Some(TransportTls {
            cert_path: config.tls.cert_path.clone(),
            key_path: config.tls.key_path.clone(),
            ca_path: config.tls.ca_path.clone(),
            domain: None,
        });
        let transport = GrpcTransport::new(transport_config, Arc::clone(&queue));

        let mut watchers: Vec<Box<dyn Watcher>> = Vec::new();
        let network_rules = config.rules_of_type(TripwireType::Network);
        if !network_rules.is_empty() {
            watchers.push(Box::new(NetworkWatcher::new(&network_rules)));
        }
        let file_rules = config.rules_of_type(TripwireType::File);
        if !file_rules.is_empty() {
            watchers.push(Box::new(FileWatcher::new(&file_rules)));
        }
        let process_rules = config.rules_of_type(TripwireType::Process);
        if !process_rules.is_empty() {
            watchers.push(Box::new(ProcessWatcher::new(&process_rules)));
        }
        if watchers.is_empty() {
            // Still worth running: a queue backlog from a previous run
            // gets delivered even with nothing new to watch.
            warn!("no rules configured, agent will only drain the queue");
        }

        Ok(Self {
            queue,
            audit,
            transport,
            watchers,
            dispatchers: Vec::new(),
            started: Instant::now(),
            last_alert_us: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Start the transport, every watcher, and one dispatch task per
    /// watcher
    pub async fn start(&mut self) -> Result<()> {
        self.transport.start()?;

        let handle = self
            .transport
            .handle()
            .ok_or(TripwireError::TransportClosed)?;

        for watcher in &mut self.watchers {
            let mut rx = watcher.start().await?;
            let name = watcher.name().to_string();
            let queue = Arc::clone(&self.queue);
            let audit = Arc::clone(&self.audit);
            let sender = handle.clone();
            let last_alert = Arc::clone(&self.last_alert_us);

            self.dispatchers.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    last_alert.store(event.timestamp.timestamp_micros(), Ordering::Relaxed);
                    dispatch(&name, event, &queue, &audit, &sender);
                }
                info!(watcher = %name, "dispatcher drained");
            }));
        }

        info!(watchers = self.watchers.len(), "agent started");
        Ok(())
    }

    /// Health endpoint state for this agent
    pub fn health_state(&self) -> HealthState {
        HealthState {
            queue: Arc::clone(&self.queue),
            counters: self.transport.counters(),
            conn_state: self.transport.state(),
            started: self.started,
            last_alert_us: Arc::clone(&self.last_alert_us),
        }
    }

    /// Number of undelivered alerts
    pub fn queue_depth(&self) -> i64 {
        self.queue.depth()
    }

    /// Stop everything in dependency order; no event is left mid-flight
    pub async fn stop(&mut self) {
        for watcher in &mut self.watchers {
            watcher.stop().await;
        }
        for task in self.dispatchers.drain(..) {
            let _ = task.await;
        }
        self.transport.stop().await;
        self.queue.close();
        if let Err(e) = self.audit.sync() {
            warn!(error = %e, "audit sync on shutdown failed");
        }
        info!("agent stopped");
    }
}

/// Record one event: audit first, then the durable queue, then the live
/// path. Queue failure is surfaced loudly but does not stop the watcher;
/// a full live buffer is routine (the drain loop picks the event up).
fn dispatch(
    watcher: &str,
    event: crate::alert::AlertEvent,
    queue: &Arc<AlertQueue>,
    audit: &Arc<AuditLog>,
    sender: &TransportHandle,
) {
    match serde_json::to_value(&event) {
        Ok(payload) => {
            if let Err(e) = audit.append(payload) {
                error!(watcher, error = %e, "audit append failed");
            }
        }
        Err(e) => error!(watcher, error = %e, "event not serializable for audit"),
    }

    let id = match queue.enqueue(&event) {
        Ok(id) => id,
        Err(e) => {
            error!(
                watcher,
                rule = %event.rule_name,
                error = %e,
                "queue write failed, event lost"
            );
            return;
        }
    };

    match sender.send(QueuedAlert { id, event }) {
        Ok(()) => {}
        Err(TripwireError::TransportBusy) | Err(TripwireError::TransportClosed) => {
            // Stays in the queue; delivered on the next drain.
        }
        Err(e) => warn!(watcher, error = %e, "live send failed"),
    }
}

//! Auto-reconnecting gRPC client for agent-to-dashboard delivery
//!
//! Runs a single background task owning the connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Registering -> Streaming
//!                     ^                            |
//!                     +-------- BackingOff <-------+  (on any failure)
//! ```
//!
//! Registration repeats after every reconnect and yields the stable
//! host_id the server knows us by. Once streaming, the transport first
//! drains the durable queue in batches, acking each row as the server
//! confirms it, then forwards live events. Acks arrive in send order, so
//! a FIFO of in-flight rows pairs them back up.
//!
//! Reconnect back-off doubles from the configured floor to the ceiling
//! with +/-25% jitter. `stop` cancels mid-backoff and mid-stream alike.

use crate::alert::AlertEvent;
use crate::error::{Result, TripwireError};
use crate::pb::alert_service_client::AlertServiceClient;
use crate::pb::{AgentEvent, RegisterRequest, ServerCommand};
use crate::queue::{AlertQueue, QueuedAlert};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

/// Default floor of the reconnect back-off
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default ceiling of the reconnect back-off
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Default live event buffer capacity
pub const DEFAULT_LIVE_BUFFER: usize = 256;
/// Default queue drain batch size
pub const DEFAULT_DRAIN_BATCH: usize = 50;

/// Connection lifecycle, observable through [`GrpcTransport::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Registering,
    Streaming,
    BackingOff,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registering => "registering",
            Self::Streaming => "streaming",
            Self::BackingOff => "backing_off",
        }
    }
}

/// Client certificate material for mTLS; `None` means a plaintext
/// connection (local development and tests only)
#[derive(Debug, Clone)]
pub struct TransportTls {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
    /// Override for the server name checked against its certificate
    pub domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server endpoint, e.g. "https://dashboard.example.com:4443"
    pub endpoint: String,
    pub tls: Option<TransportTls>,
    pub hostname: String,
    pub platform: String,
    pub agent_version: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub live_buffer: usize,
    pub drain_batch: usize,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls: None,
            hostname: hostname.into(),
            platform: std::env::consts::OS.to_string(),
            agent_version: String::new(),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            live_buffer: DEFAULT_LIVE_BUFFER,
            drain_batch: DEFAULT_DRAIN_BATCH,
        }
    }
}

/// Delivery counters, shared with health reporting
#[derive(Debug, Default)]
pub struct TransportCounters {
    /// Events confirmed by the server
    pub alerts_sent_total: AtomicU64,
    /// Connection attempts after the first
    pub reconnect_total: AtomicU64,
}

/// Background delivery client
pub struct GrpcTransport {
    config: TransportConfig,
    queue: Arc<AlertQueue>,
    counters: Arc<TransportCounters>,
    live_tx: Option<mpsc::Sender<QueuedAlert>>,
    state_rx: watch::Receiver<ConnState>,
    state_tx: watch::Sender<ConnState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GrpcTransport {
    pub fn new(config: TransportConfig, queue: Arc<AlertQueue>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        Self {
            config,
            queue,
            counters: Arc::new(TransportCounters::default()),
            live_tx: None,
            state_rx,
            state_tx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Launch the connection loop. May be called at most once.
    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(TripwireError::Transport(
                "transport already started".to_string(),
            ));
        }

        let (live_tx, live_rx) = mpsc::channel(self.config.live_buffer);
        self.live_tx = Some(live_tx);

        let config = self.config.clone();
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        let state = self.state_tx.clone();
        let cancel = self.cancel.clone();

        info!(endpoint = %config.endpoint, "transport starting");
        self.task = Some(tokio::spawn(run(
            config, queue, counters, state, cancel, live_rx,
        )));
        Ok(())
    }

    /// Hand an already-queued event to the live send path. Errors are
    /// explicit, never silent drops: [`TripwireError::TransportClosed`]
    /// before `start`/after `stop`, [`TripwireError::TransportBusy`] when
    /// not currently streaming or the buffer is full. In every error case
    /// the event remains in the queue and is delivered on the next drain.
    pub fn send(&self, alert: QueuedAlert) -> Result<()> {
        match self.handle() {
            Some(handle) => handle.send(alert),
            None => Err(TripwireError::TransportClosed),
        }
    }

    /// Clonable handle to the live send path, for dispatch tasks that
    /// outlive their borrow of the transport. `None` before `start`.
    pub fn handle(&self) -> Option<TransportHandle> {
        self.live_tx.as_ref().map(|tx| TransportHandle {
            tx: tx.clone(),
            state_rx: self.state_rx.clone(),
        })
    }

    /// Watch the connection state machine
    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// Current state snapshot
    pub fn current_state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn counters(&self) -> Arc<TransportCounters> {
        Arc::clone(&self.counters)
    }

    /// Undelivered events still in the durable queue
    pub fn queue_depth(&self) -> i64 {
        self.queue.depth()
    }

    /// Cancel the connection loop and wait for it to exit. Completes even
    /// mid-backoff. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.live_tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Live send path detached from the transport's lifetime
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<QueuedAlert>,
    state_rx: watch::Receiver<ConnState>,
}

impl TransportHandle {
    /// Same contract as [`GrpcTransport::send`]
    pub fn send(&self, alert: QueuedAlert) -> Result<()> {
        if *self.state_rx.borrow() != ConnState::Streaming {
            return Err(TripwireError::TransportBusy);
        }
        match self.tx.try_send(alert) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TripwireError::TransportBusy),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TripwireError::TransportClosed),
        }
    }
}

/// Double the delay and clamp to the ceiling
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Apply +/-25% jitter so a fleet of agents does not reconnect in step
fn jittered(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    d.mul_f64(factor)
}

async fn run(
    config: TransportConfig,
    queue: Arc<AlertQueue>,
    counters: Arc<TransportCounters>,
    state: watch::Sender<ConnState>,
    cancel: CancellationToken,
    mut live_rx: mpsc::Receiver<QueuedAlert>,
) {
    let mut backoff = config.initial_backoff;
    let mut attempts: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if attempts > 0 {
            counters.reconnect_total.fetch_add(1, Ordering::Relaxed);
        }
        attempts += 1;

        let _ = state.send(ConnState::Connecting);
        match session(
            &config,
            &queue,
            &counters,
            &state,
            &cancel,
            &mut live_rx,
            &mut backoff,
        )
        .await
        {
            Ok(()) => break, // cancelled or live channel closed
            Err(e) => {
                warn!(error = %e, delay = ?backoff, "connection lost, backing off");
            }
        }

        let _ = state.send(ConnState::BackingOff);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(jittered(backoff)) => {}
        }
        backoff = next_backoff(backoff, config.max_backoff);
    }

    let _ = state.send(ConnState::Disconnected);
    debug!("transport stopped");
}

/// One connect-register-stream session. Ok means a deliberate shutdown;
/// Err means the caller should back off and retry.
async fn session(
    config: &TransportConfig,
    queue: &Arc<AlertQueue>,
    counters: &Arc<TransportCounters>,
    state: &watch::Sender<ConnState>,
    cancel: &CancellationToken,
    live_rx: &mut mpsc::Receiver<QueuedAlert>,
    backoff: &mut Duration,
) -> Result<()> {
    let channel = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        channel = connect(config) => channel?,
    };
    let mut client = AlertServiceClient::new(channel);

    let _ = state.send(ConnState::Registering);
    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        response = client.register_agent(RegisterRequest {
            hostname: config.hostname.clone(),
            platform: config.platform.clone(),
            agent_version: config.agent_version.clone(),
        }) => response.map_err(|e| TripwireError::Transport(format!("register: {}", e)))?,
    };
    let host_id = response.into_inner().host_id;
    info!(host_id = %host_id, "registered with dashboard");

    let _ = state.send(ConnState::Streaming);
    // A healthy session resets the retry schedule.
    *backoff = config.initial_backoff;

    let (out_tx, out_rx) = mpsc::channel::<AgentEvent>(config.live_buffer);
    let mut inbound = client
        .stream_alerts(ReceiverStream::new(out_rx))
        .await
        .map_err(|e| TripwireError::Transport(format!("open stream: {}", e)))?
        .into_inner();

    // In-flight rows, acked by the server in send order.
    let mut pending: VecDeque<(i64, String)> = VecDeque::new();

    // Drain the backlog batch by batch; each batch must be fully acked
    // before the next dequeue, or we would re-read the same rows.
    loop {
        let batch = queue.dequeue(config.drain_batch)?;
        if batch.is_empty() {
            break;
        }
        debug!(events = batch.len(), "draining queued alerts");
        for alert in batch {
            send_one(&out_tx, &host_id, &alert, &mut pending).await?;
        }
        while !pending.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = inbound.message() => handle_ack(msg, &mut pending, queue, counters)?,
            }
        }
    }

    // Live phase: forward fresh events, retire acks as they arrive.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = inbound.message() => handle_ack(msg, &mut pending, queue, counters)?,
            item = live_rx.recv() => match item {
                Some(alert) => send_one(&out_tx, &host_id, &alert, &mut pending).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn connect(config: &TransportConfig) -> Result<Channel> {
    let mut endpoint = Endpoint::from_shared(config.endpoint.clone())
        .map_err(|e| TripwireError::Transport(format!("bad endpoint: {}", e)))?
        .connect_timeout(Duration::from_secs(10));

    if let Some(tls) = &config.tls {
        let cert = tokio::fs::read(&tls.cert_path).await?;
        let key = tokio::fs::read(&tls.key_path).await?;
        let ca = tokio::fs::read(&tls.ca_path).await?;

        let mut tls_config = ClientTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .ca_certificate(Certificate::from_pem(ca));
        if let Some(domain) = &tls.domain {
            tls_config = tls_config.domain_name(domain.clone());
        }
        endpoint = endpoint
            .tls_config(tls_config)
            .map_err(|e| TripwireError::Transport(format!("tls config: {}", e)))?;
    }

    endpoint
        .connect()
        .await
        .map_err(|e| TripwireError::Transport(format!("connect {}: {}", config.endpoint, e)))
}

fn to_wire(host_id: &str, event: &AlertEvent) -> AgentEvent {
    AgentEvent {
        alert_id: event.alert_id.to_string(),
        host_id: host_id.to_string(),
        timestamp_us: event.timestamp.timestamp_micros(),
        tripwire_type: event.tripwire_type.as_str().to_string(),
        rule_name: event.rule_name.clone(),
        severity: event.severity.as_str().to_string(),
        event_detail_json: event.detail_json(),
    }
}

async fn send_one(
    out_tx: &mpsc::Sender<AgentEvent>,
    host_id: &str,
    alert: &QueuedAlert,
    pending: &mut VecDeque<(i64, String)>,
) -> Result<()> {
    let wire = to_wire(host_id, &alert.event);
    let alert_id = wire.alert_id.clone();
    out_tx
        .send(wire)
        .await
        .map_err(|_| TripwireError::Transport("outbound stream closed".to_string()))?;
    pending.push_back((alert.id, alert_id));
    Ok(())
}

/// Pair one server reply with the oldest in-flight row and retire it.
/// An ERROR ack still retires the row: the event was rejected by
/// validation and redelivering it can never succeed.
fn handle_ack(
    msg: std::result::Result<Option<ServerCommand>, tonic::Status>,
    pending: &mut VecDeque<(i64, String)>,
    queue: &Arc<AlertQueue>,
    counters: &Arc<TransportCounters>,
) -> Result<()> {
    let command = msg
        .map_err(|e| TripwireError::Transport(format!("stream recv: {}", e)))?
        .ok_or_else(|| TripwireError::Transport("server closed the stream".to_string()))?;

    let (row_id, sent_alert_id) = match pending.pop_front() {
        Some(front) => front,
        None => {
            warn!(kind = %command.kind, "server ack with no event in flight");
            return Ok(());
        }
    };

    if let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&command.payload) {
        if let Some(acked_id) = payload["alert_id"].as_str() {
            if acked_id != sent_alert_id {
                warn!(expected = %sent_alert_id, got = %acked_id, "out-of-order ack");
            }
        }
        if command.kind == "ERROR" {
            warn!(
                alert_id = %sent_alert_id,
                error = %payload["error"],
                "server rejected alert"
            );
        }
    }

    queue.ack(&[row_id])?;
    if command.kind == "ACK" {
        counters.alerts_sent_total.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Severity, TripwireType};
    use tempfile::tempdir;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let max = Duration::from_secs(60);
        let mut d = Duration::from_secs(1);
        let expected = [2u64, 4, 8, 16, 32, 60, 60];
        for want in expected {
            d = next_backoff(d, max);
            assert_eq!(d, Duration::from_secs(want));
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_secs(8);
        for _ in 0..200 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs(6), "jitter below band: {:?}", j);
            assert!(j <= Duration::from_secs(10), "jitter above band: {:?}", j);
        }
    }

    #[test]
    fn test_to_wire_conversion() {
        let event = AlertEvent::new(TripwireType::Network, "ssh-probe", Severity::Critical)
            .with_detail("dest_port", serde_json::json!(22));
        let wire = to_wire("host-1", &event);

        assert_eq!(wire.alert_id, event.alert_id.to_string());
        assert_eq!(wire.host_id, "host-1");
        assert_eq!(wire.tripwire_type, "NETWORK");
        assert_eq!(wire.severity, "CRITICAL");
        let detail: serde_json::Value = serde_json::from_slice(&wire.event_detail_json).unwrap();
        assert_eq!(detail["dest_port"], 22);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(AlertQueue::open(dir.path().join("q.db")).unwrap());
        let transport =
            GrpcTransport::new(TransportConfig::new("http://127.0.0.1:1", "host"), queue);

        let event = AlertEvent::new(TripwireType::File, "r", Severity::Info);
        let alert = QueuedAlert { id: 1, event };
        assert!(matches!(
            transport.send(alert),
            Err(TripwireError::TransportClosed)
        ));
        assert_eq!(transport.current_state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_completes_during_backoff() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(AlertQueue::open(dir.path().join("q.db")).unwrap());

        // Nothing listens on this endpoint, so the transport will be stuck
        // in the connect/backoff cycle.
        let mut config = TransportConfig::new("http://127.0.0.1:1", "host");
        config.initial_backoff = Duration::from_secs(30);
        config.max_backoff = Duration::from_secs(60);

        let mut transport = GrpcTransport::new(config, queue);
        transport.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), transport.stop())
            .await
            .expect("stop did not complete during backoff");
        assert_eq!(transport.current_state(), ConnState::Disconnected);

        let event = AlertEvent::new(TripwireType::File, "r", Severity::Info);
        assert!(matches!(
            transport.send(QueuedAlert { id: 1, event }),
            Err(TripwireError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(AlertQueue::open(dir.path().join("q.db")).unwrap());
        let mut transport =
            GrpcTransport::new(TransportConfig::new("http://127.0.0.1:1", "host"), queue);

        transport.start().unwrap();
        assert!(transport.start().is_err());
        transport.stop().await;
    }
}

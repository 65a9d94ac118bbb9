//! gRPC ingestion service
//!
//! Implements the two agent-facing RPCs. Registration prefers the
//! hostname from the client certificate's common name over the one the
//! agent claims, since the certificate is the authenticated identity.
//! Ingestion validates each event, persists it, publishes to the
//! broadcaster with a non-blocking send, and acknowledges in order; a
//! bad event earns an ERROR ack and the stream carries on.

use crate::alert::{Severity, TripwireType};
use crate::pb::alert_service_server::AlertService;
use crate::pb::{AgentEvent, RegisterRequest, RegisterResponse, ServerCommand};
use crate::server::broadcaster::Broadcaster;
use crate::server::storage::{Store, StoredAlert};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

/// Oldest accepted event age, seconds
pub const DEFAULT_MAX_EVENT_AGE_SECS: i64 = 300;
/// Maximum accepted clock skew into the future, seconds
pub const MAX_FUTURE_SKEW_SECS: i64 = 60;

/// Per-stream ack channel capacity
const ACK_BUFFER: usize = 64;

/// The collector's AlertService implementation
pub struct AlertIngest {
    store: Arc<dyn Store>,
    broadcaster: Arc<Broadcaster>,
    max_event_age: ChronoDuration,
}

impl AlertIngest {
    pub fn new(store: Arc<dyn Store>, broadcaster: Arc<Broadcaster>) -> Self {
        Self::with_max_age(store, broadcaster, DEFAULT_MAX_EVENT_AGE_SECS)
    }

    pub fn with_max_age(
        store: Arc<dyn Store>,
        broadcaster: Arc<Broadcaster>,
        max_event_age_secs: i64,
    ) -> Self {
        Self {
            store,
            broadcaster,
            max_event_age: ChronoDuration::seconds(max_event_age_secs),
        }
    }
}

/// Hostname asserted by the peer certificate's subject CN, if the
/// connection carried one
fn peer_cert_hostname<T>(request: &Request<T>) -> Option<String> {
    let certs = request.peer_certs()?;
    let bytes: &[u8] = certs.first()?.as_ref();
    common_name(bytes)
}

/// Subject CN from a DER (or PEM) encoded certificate
fn common_name(bytes: &[u8]) -> Option<String> {
    let parsed;
    let der = if bytes.starts_with(b"-----BEGIN") {
        parsed = x509_parser::pem::parse_x509_pem(bytes).ok()?.1;
        parsed.contents.as_slice()
    } else {
        bytes
    };
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(|s| s.to_string())
}

/// Check one inbound event. Returns the parsed fields or the reason the
/// event must be rejected.
fn validate_event(
    event: &AgentEvent,
    now: DateTime<Utc>,
    max_age: ChronoDuration,
) -> std::result::Result<(TripwireType, Severity, DateTime<Utc>, serde_json::Value), String> {
    if event.alert_id.is_empty() {
        return Err("alert_id is required".to_string());
    }
    if event.host_id.is_empty() {
        return Err("host_id is required".to_string());
    }
    if event.rule_name.is_empty() {
        return Err("rule_name is required".to_string());
    }

    let tripwire_type =
        TripwireType::from_str(&event.tripwire_type).map_err(|e| e.to_string())?;
    let severity = Severity::from_str(&event.severity).map_err(|e| e.to_string())?;

    let timestamp = Utc
        .timestamp_micros(event.timestamp_us)
        .single()
        .ok_or_else(|| format!("timestamp_us {} is out of range", event.timestamp_us))?;
    if timestamp < now - max_age {
        return Err(format!(
            "timestamp {} is older than the accepted window",
            timestamp.to_rfc3339()
        ));
    }
    if timestamp > now + ChronoDuration::seconds(MAX_FUTURE_SKEW_SECS) {
        return Err(format!(
            "timestamp {} is too far in the future",
            timestamp.to_rfc3339()
        ));
    }

    let detail = if event.event_detail_json.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&event.event_detail_json)
            .map_err(|e| format!("event_detail_json is not valid JSON: {}", e))?
    };

    Ok((tripwire_type, severity, timestamp, detail))
}

fn ack(alert_id: &str) -> ServerCommand {
    ServerCommand {
        kind: "ACK".to_string(),
        payload: serde_json::to_vec(&json!({ "alert_id": alert_id })).unwrap_or_default(),
    }
}

fn error_ack(alert_id: &str, reason: &str) -> ServerCommand {
    ServerCommand {
        kind: "ERROR".to_string(),
        payload: serde_json::to_vec(&json!({ "alert_id": alert_id, "error": reason }))
            .unwrap_or_default(),
    }
}

/// Validate, persist, and publish one event, producing its ack. Invalid
/// and unpersistable events are never published.
fn ingest_one(
    store: &Arc<dyn Store>,
    broadcaster: &Arc<Broadcaster>,
    event: &AgentEvent,
    max_age: ChronoDuration,
) -> ServerCommand {
    let (tripwire_type, severity, timestamp, detail) =
        match validate_event(event, Utc::now(), max_age) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(alert_id = %event.alert_id, %reason, "rejecting invalid event");
                return error_ack(&event.alert_id, &reason);
            }
        };

    let host = match store.host(&event.host_id) {
        Ok(Some(host)) => host,
        Ok(None) => {
            let reason = format!("unknown host_id {:?}", event.host_id);
            warn!(alert_id = %event.alert_id, %reason, "rejecting event");
            return error_ack(&event.alert_id, &reason);
        }
        Err(e) => {
            warn!(alert_id = %event.alert_id, error = %e, "host lookup failed");
            return error_ack(&event.alert_id, &e.to_string());
        }
    };

    let stored = StoredAlert {
        alert_id: event.alert_id.clone(),
        host_id: host.id,
        hostname: host.hostname,
        tripwire_type,
        rule_name: event.rule_name.clone(),
        severity,
        timestamp,
        detail,
        received_at: Utc::now(),
    };

    match store.insert_alert(&stored) {
        Ok(true) => {
            debug!(alert_id = %stored.alert_id, rule = %stored.rule_name, "alert stored");
            broadcaster.publish(Arc::new(stored));
            ack(&event.alert_id)
        }
        Ok(false) => {
            // Redelivery after a lost ack; already persisted and published.
            debug!(alert_id = %stored.alert_id, "duplicate alert, re-acking");
            ack(&event.alert_id)
        }
        Err(e) => {
            warn!(alert_id = %stored.alert_id, error = %e, "alert persistence failed");
            error_ack(&event.alert_id, &e.to_string())
        }
    }
}

#[tonic::async_trait]
impl AlertService for AlertIngest {
    async fn register_agent(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<RegisterResponse>, Status> {
        let cert_hostname = peer_cert_hostname(&request);
        let req = request.into_inner();

        let hostname = cert_hostname.unwrap_or_else(|| req.hostname.clone());
        if hostname.is_empty() {
            return Err(Status::invalid_argument("hostname is required"));
        }

        let host = self
            .store
            .upsert_host(&hostname, &req.platform, &req.agent_version)
            .map_err(|e| Status::internal(e.to_string()))?;

        info!(
            hostname = %host.hostname,
            host_id = %host.id,
            version = %host.agent_version,
            "agent registered"
        );

        Ok(Response::new(RegisterResponse {
            host_id: host.id,
            server_time_us: Utc::now().timestamp_micros(),
        }))
    }

    type StreamAlertsStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ServerCommand, Status>> + Send + 'static>>;

    async fn stream_alerts(
        &self,
        request: Request<Streaming<AgentEvent>>,
    ) -> std::result::Result<Response<Self::StreamAlertsStream>, Status> {
        let mut inbound = request.into_inner();
        let store = Arc::clone(&self.store);
        let broadcaster = Arc::clone(&self.broadcaster);
        let max_age = self.max_event_age;

        let (tx, rx) = mpsc::channel(ACK_BUFFER);

        tokio::spawn(async move {
            while let Some(next) = inbound.next().await {
                let event = match next {
                    Ok(event) => event,
                    Err(status) => {
                        debug!(error = %status, "alert stream closed by transport");
                        break;
                    }
                };

                let reply = ingest_one(&store, &broadcaster, &event, max_age);
                if tx.send(Ok(reply)).await.is_err() {
                    // Client stopped reading acks; tear the stream down.
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::storage::SqliteStore;

    fn setup() -> (Arc<dyn Store>, Arc<Broadcaster>, String) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let host = store.upsert_host("web-01", "linux", "1.0.0").unwrap();
        (store, Arc::new(Broadcaster::new()), host.id)
    }

    fn event(alert_id: &str, host_id: &str) -> AgentEvent {
        AgentEvent {
            alert_id: alert_id.to_string(),
            host_id: host_id.to_string(),
            timestamp_us: Utc::now().timestamp_micros(),
            tripwire_type: "NETWORK".to_string(),
            rule_name: "ssh-probe".to_string(),
            severity: "CRITICAL".to_string(),
            event_detail_json: serde_json::to_vec(&json!({"dest_port": 22})).unwrap(),
        }
    }

    fn max_age() -> ChronoDuration {
        ChronoDuration::seconds(DEFAULT_MAX_EVENT_AGE_SECS)
    }

    #[test]
    fn test_validate_accepts_good_event() {
        let (_, _, host_id) = setup();
        let ev = event("a1", &host_id);
        let (ttype, sev, _, detail) = validate_event(&ev, Utc::now(), max_age()).unwrap();
        assert_eq!(ttype, TripwireType::Network);
        assert_eq!(sev, Severity::Critical);
        assert_eq!(detail["dest_port"], 22);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut ev = event("a1", "h1");
        ev.alert_id = String::new();
        assert!(validate_event(&ev, Utc::now(), max_age())
            .unwrap_err()
            .contains("alert_id"));

        let mut ev = event("a1", "h1");
        ev.rule_name = String::new();
        assert!(validate_event(&ev, Utc::now(), max_age())
            .unwrap_err()
            .contains("rule_name"));
    }

    #[test]
    fn test_validate_rejects_bad_enums() {
        let mut ev = event("a1", "h1");
        ev.tripwire_type = "UNKNOWN".to_string();
        assert!(validate_event(&ev, Utc::now(), max_age()).is_err());

        let mut ev = event("a1", "h1");
        ev.severity = "PANIC".to_string();
        assert!(validate_event(&ev, Utc::now(), max_age()).is_err());
    }

    #[test]
    fn test_validate_timestamp_window() {
        let now = Utc::now();

        let mut ev = event("a1", "h1");
        ev.timestamp_us = (now - ChronoDuration::seconds(301)).timestamp_micros();
        assert!(validate_event(&ev, now, max_age()).unwrap_err().contains("older"));

        let mut ev = event("a1", "h1");
        ev.timestamp_us = (now + ChronoDuration::seconds(61)).timestamp_micros();
        assert!(validate_event(&ev, now, max_age()).unwrap_err().contains("future"));

        // Just inside both edges.
        let mut ev = event("a1", "h1");
        ev.timestamp_us = (now - ChronoDuration::seconds(299)).timestamp_micros();
        assert!(validate_event(&ev, now, max_age()).is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_detail() {
        let mut ev = event("a1", "h1");
        ev.event_detail_json = b"{not json".to_vec();
        assert!(validate_event(&ev, Utc::now(), max_age())
            .unwrap_err()
            .contains("JSON"));
    }

    #[test]
    fn test_validate_empty_detail_is_null() {
        let mut ev = event("a1", "h1");
        ev.event_detail_json = Vec::new();
        let (_, _, _, detail) = validate_event(&ev, Utc::now(), max_age()).unwrap();
        assert!(detail.is_null());
    }

    #[test]
    fn test_ingest_persists_and_publishes() {
        let (store, broadcaster, host_id) = setup();
        let (_sub, mut rx) = broadcaster.subscribe();

        let reply = ingest_one(&store, &broadcaster, &event("a1", &host_id), max_age());
        assert_eq!(reply.kind, "ACK");

        let published = rx.try_recv().unwrap();
        assert_eq!(published.alert_id, "a1");
        assert_eq!(published.hostname, "web-01");
        assert_eq!(store.recent_alerts(10).unwrap().len(), 1);
    }

    #[test]
    fn test_ingest_duplicate_reacks_without_republish() {
        let (store, broadcaster, host_id) = setup();
        let (_sub, mut rx) = broadcaster.subscribe();

        let ev = event("a1", &host_id);
        assert_eq!(ingest_one(&store, &broadcaster, &ev, max_age()).kind, "ACK");
        assert_eq!(ingest_one(&store, &broadcaster, &ev, max_age()).kind, "ACK");

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.recent_alerts(10).unwrap().len(), 1);
    }

    #[test]
    fn test_ingest_invalid_event_not_persisted() {
        let (store, broadcaster, host_id) = setup();

        let mut bad = event("bad-1", &host_id);
        bad.tripwire_type = "UNKNOWN".to_string();
        let reply = ingest_one(&store, &broadcaster, &bad, max_age());

        assert_eq!(reply.kind, "ERROR");
        let payload: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(payload["alert_id"], "bad-1");
        assert!(payload["error"].as_str().unwrap().contains("tripwire_type"));
        assert!(store.recent_alerts(10).unwrap().is_empty());
    }

    #[test]
    fn test_ingest_unknown_host_rejected() {
        let (store, broadcaster, _) = setup();
        let reply = ingest_one(&store, &broadcaster, &event("a1", "no-such-host"), max_age());
        assert_eq!(reply.kind, "ERROR");
    }

    #[test]
    fn test_stream_resilience_one_bad_among_good() {
        let (store, broadcaster, host_id) = setup();

        let mut bad = event("bad-1", &host_id);
        bad.severity = "PANIC".to_string();
        let batch = [event("a1", &host_id), bad, event("a2", &host_id)];

        let replies: Vec<ServerCommand> = batch
            .iter()
            .map(|ev| ingest_one(&store, &broadcaster, ev, max_age()))
            .collect();

        assert_eq!(replies[0].kind, "ACK");
        assert_eq!(replies[1].kind, "ERROR");
        assert_eq!(replies[2].kind, "ACK");

        let stored = store.recent_alerts(10).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|a| a.alert_id != "bad-1"));
    }

    #[tokio::test]
    async fn test_register_agent_roundtrip() {
        let (store, broadcaster, _) = setup();
        let svc = AlertIngest::new(Arc::clone(&store), broadcaster);

        let req = Request::new(RegisterRequest {
            hostname: "web-02".to_string(),
            platform: "linux".to_string(),
            agent_version: "1.2.0".to_string(),
        });
        let first = svc.register_agent(req).await.unwrap().into_inner();
        assert!(!first.host_id.is_empty());
        assert!(first.server_time_us > 0);

        // Same hostname again, e.g. after a reconnect: same host_id.
        let req = Request::new(RegisterRequest {
            hostname: "web-02".to_string(),
            platform: "linux".to_string(),
            agent_version: "1.2.1".to_string(),
        });
        let second = svc.register_agent(req).await.unwrap().into_inner();
        assert_eq!(first.host_id, second.host_id);
    }

    #[tokio::test]
    async fn test_register_agent_empty_hostname_rejected() {
        let (store, broadcaster, _) = setup();
        let svc = AlertIngest::new(store, broadcaster);

        let req = Request::new(RegisterRequest {
            hostname: String::new(),
            platform: "linux".to_string(),
            agent_version: "1.0.0".to_string(),
        });
        let status = svc.register_agent(req).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}

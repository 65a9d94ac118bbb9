//! Network tripwire: polls the kernel TCP connection tables
//!
//! Reads `/proc/net/tcp` and `/proc/net/tcp6` on a fixed interval and
//! raises an alert whenever a new ESTABLISHED connection appears on a
//! watched local port. Each distinct connection (rule + local endpoint +
//! remote endpoint) alerts once while it persists; if the same peer
//! disconnects and reconnects, that is a new connection and alerts again.
//!
//! Malformed table lines are logged and skipped so one bad row never
//! hides the rest of the table, and a failed poll leaves the previous
//! state untouched.

use crate::alert::{AlertEvent, Severity, TripwireType};
use crate::config::TripwireRule;
use crate::error::{Result, TripwireError};
use crate::watcher::{Watcher, EVENT_BUFFER};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// TCP state code for ESTABLISHED in the proc tables
const TCP_ESTABLISHED: u8 = 0x01;

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Source of raw connection table snapshots. The production source reads
/// the proc filesystem; tests substitute fixed strings.
pub trait ConnTableSource: Send + Sync {
    /// Return the current contents of each TCP table
    fn read_tables(&self) -> Result<Vec<String>>;
}

/// Reads `/proc/net/tcp` and `/proc/net/tcp6`
pub struct ProcNetSource;

impl ConnTableSource for ProcNetSource {
    fn read_tables(&self) -> Result<Vec<String>> {
        let mut tables = Vec::with_capacity(2);
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match std::fs::read_to_string(path) {
                Ok(content) => tables.push(content),
                // tcp6 is absent on v4-only kernels; that is not an error.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path, "connection table not present");
                }
                Err(e) => {
                    return Err(TripwireError::Watcher(format!("read {}: {}", path, e)));
                }
            }
        }
        Ok(tables)
    }
}

/// One parsed row of a proc TCP table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: u8,
}

/// A network rule with its target parsed into a port
#[derive(Debug, Clone)]
struct PortRule {
    name: String,
    port: u16,
    severity: Severity,
}

/// Identity of one observed connection, the dedup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    rule: String,
    local: SocketAddr,
    remote: SocketAddr,
}

/// Polling watcher over the kernel TCP tables
pub struct NetworkWatcher {
    rules: Vec<PortRule>,
    source: Arc<dyn ConnTableSource>,
    poll_interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NetworkWatcher {
    /// Build a watcher over the given NETWORK rules, reading the real
    /// proc tables
    pub fn new(rules: &[&TripwireRule]) -> Self {
        Self::with_source(rules, Arc::new(ProcNetSource), DEFAULT_POLL_INTERVAL)
    }

    /// Build a watcher with a custom table source and interval
    pub fn with_source(
        rules: &[&TripwireRule],
        source: Arc<dyn ConnTableSource>,
        poll_interval: Duration,
    ) -> Self {
        let mut parsed = Vec::new();
        for rule in rules {
            let port = match rule.target.parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => {
                    warn!(
                        rule = %rule.name,
                        target = %rule.target,
                        "network rule target is not a valid port, skipping rule"
                    );
                    continue;
                }
            };
            let severity = rule.parsed_severity().unwrap_or(Severity::Warn);
            parsed.push(PortRule {
                name: rule.name.clone(),
                port,
                severity,
            });
        }

        Self {
            rules: parsed,
            source,
            poll_interval,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Number of rules that survived target parsing
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[async_trait]
impl Watcher for NetworkWatcher {
    fn name(&self) -> &str {
        "network"
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<AlertEvent>> {
        if self.task.is_some() {
            return Err(TripwireError::Watcher(
                "network watcher already started".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let rules = self.rules.clone();
        let source = Arc::clone(&self.source);
        let interval = self.poll_interval;
        let cancel = self.cancel.clone();

        info!(rules = rules.len(), ?interval, "network watcher starting");

        self.task = Some(tokio::spawn(async move {
            let mut active: HashSet<ConnKey> = HashSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let tables = match source.read_tables() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "connection table poll failed");
                        continue;
                    }
                };

                let mut entries = Vec::new();
                for table in &tables {
                    entries.extend(parse_proc_net(table));
                }

                for event in scan(&rules, &entries, &mut active) {
                    if let Err(mpsc::error::TrySendError::Full(evt)) = tx.try_send(event) {
                        warn!(rule = %evt.rule_name, "event buffer full, dropping alert");
                    }
                }
            }
            debug!("network watcher stopped");
        }));

        Ok(rx)
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Diff the current table against the known-active set. New ESTABLISHED
/// connections on a watched port produce events; connections that have
/// gone away are forgotten so a later reconnect alerts again.
fn scan(rules: &[PortRule], entries: &[ConnEntry], active: &mut HashSet<ConnKey>) -> Vec<AlertEvent> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    for entry in entries {
        if entry.state != TCP_ESTABLISHED {
            continue;
        }
        for rule in rules {
            if entry.local.port() != rule.port {
                continue;
            }
            let key = ConnKey {
                rule: rule.name.clone(),
                local: entry.local,
                remote: entry.remote,
            };
            if !active.contains(&key) {
                events.push(
                    AlertEvent::new(TripwireType::Network, rule.name.clone(), rule.severity)
                        .with_detail("local_addr", json!(entry.local.ip().to_string()))
                        .with_detail("local_port", json!(entry.local.port()))
                        .with_detail("remote_addr", json!(entry.remote.ip().to_string()))
                        .with_detail("remote_port", json!(entry.remote.port())),
                );
            }
            seen.insert(key);
        }
    }

    *active = seen;
    events
}

/// Parse one proc TCP table. The header line and any malformed rows are
/// skipped with a log line rather than failing the whole snapshot.
pub fn parse_proc_net(table: &str) -> Vec<ConnEntry> {
    let mut entries = Vec::new();
    for line in table.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_proc_net_line(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(error = %e, line, "skipping malformed connection table row"),
        }
    }
    entries
}

fn parse_proc_net_line(line: &str) -> Result<ConnEntry> {
    let mut fields = line.split_whitespace();
    let _sl = fields
        .next()
        .ok_or_else(|| TripwireError::Watcher("empty row".to_string()))?;
    let local = fields
        .next()
        .ok_or_else(|| TripwireError::Watcher("missing local address".to_string()))?;
    let remote = fields
        .next()
        .ok_or_else(|| TripwireError::Watcher("missing remote address".to_string()))?;
    let state = fields
        .next()
        .ok_or_else(|| TripwireError::Watcher("missing state".to_string()))?;

    Ok(ConnEntry {
        local: parse_hex_addr(local)?,
        remote: parse_hex_addr(remote)?,
        state: u8::from_str_radix(state, 16)
            .map_err(|e| TripwireError::Watcher(format!("bad state {:?}: {}", state, e)))?,
    })
}

/// Parse a proc-table address like "0100007F:1F90". The address half is
/// hex with each machine word stored LSB-first (one 4-byte word for v4,
/// four for v6), the port half is big-endian hex.
pub fn parse_hex_addr(s: &str) -> Result<SocketAddr> {
    let (addr_hex, port_hex) = s
        .split_once(':')
        .ok_or_else(|| TripwireError::Watcher(format!("address {:?} has no port", s)))?;

    let mut bytes = hex::decode(addr_hex)
        .map_err(|e| TripwireError::Watcher(format!("bad address hex {:?}: {}", addr_hex, e)))?;

    let ip: IpAddr = match bytes.len() {
        4 => {
            bytes.reverse();
            let octets: [u8; 4] = bytes.as_slice().try_into().unwrap();
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            for word in bytes.chunks_exact_mut(4) {
                word.reverse();
            }
            let octets: [u8; 16] = bytes.as_slice().try_into().unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        n => {
            return Err(TripwireError::Watcher(format!(
                "address {:?} has {} bytes, expected 4 or 16",
                addr_hex, n
            )));
        }
    };

    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|e| TripwireError::Watcher(format!("bad port hex {:?}: {}", port_hex, e)))?;

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const HEADER: &str =
        "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid";

    fn table(rows: &[&str]) -> String {
        let mut t = String::from(HEADER);
        for row in rows {
            t.push('\n');
            t.push_str(row);
        }
        t.push('\n');
        t
    }

    // 127.0.0.1:8080 <- 127.0.0.1:54321, ESTABLISHED
    fn row_established(local_port: u16, remote_port: u16) -> String {
        format!(
            "   0: 0100007F:{:04X} 0100007F:{:04X} 01 00000000:00000000 00:00000000 00000000  1000",
            local_port, remote_port
        )
    }

    fn rule(name: &str, port: &str) -> TripwireRule {
        TripwireRule {
            name: name.to_string(),
            rule_type: "NETWORK".to_string(),
            target: port.to_string(),
            severity: "CRITICAL".to_string(),
        }
    }

    fn port_rules(rules: &[TripwireRule]) -> Vec<PortRule> {
        let refs: Vec<&TripwireRule> = rules.iter().collect();
        NetworkWatcher::with_source(&refs, Arc::new(ProcNetSource), DEFAULT_POLL_INTERVAL).rules
    }

    struct StubSource {
        tables: Mutex<Vec<String>>,
    }

    impl ConnTableSource for StubSource {
        fn read_tables(&self) -> Result<Vec<String>> {
            Ok(vec![self.tables.lock().unwrap().join("\n")])
        }
    }

    #[test]
    fn test_parse_hex_addr_v4() {
        let addr = parse_hex_addr("0100007F:1F90").unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());

        let addr = parse_hex_addr("0101A8C0:0016").unwrap();
        assert_eq!(addr, "192.168.1.1:22".parse().unwrap());
    }

    #[test]
    fn test_parse_hex_addr_v6() {
        // ::1 as the kernel renders it: last word 0x00000001 LSB-first.
        let addr = parse_hex_addr("00000000000000000000000001000000:0016").unwrap();
        assert_eq!(addr.ip(), "::1".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port(), 22);
    }

    #[test]
    fn test_parse_hex_addr_rejects_garbage() {
        assert!(parse_hex_addr("0100007F").is_err()); // no port
        assert!(parse_hex_addr("ZZZZZZZZ:0016").is_err()); // bad hex
        assert!(parse_hex_addr("010000:0016").is_err()); // 3 bytes
        assert!(parse_hex_addr("0100007F:GGGG").is_err()); // bad port hex
    }

    #[test]
    fn test_parse_proc_net_skips_malformed_rows() {
        let t = table(&[
            &row_established(8080, 50000),
            "   1: garbage",
            &row_established(8080, 50001),
        ]);
        let entries = parse_proc_net(&t);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.local.port() == 8080));
    }

    #[test]
    fn test_parse_proc_net_empty_table() {
        assert!(parse_proc_net(HEADER).is_empty());
        assert!(parse_proc_net("").is_empty());
    }

    #[test]
    fn test_scan_alerts_once_per_connection() {
        let rules = port_rules(&[rule("ssh-probe", "22")]);
        let entries = parse_proc_net(&table(&[&row_established(22, 50000)]));
        let mut active = HashSet::new();

        // Same connection present across five consecutive polls.
        let mut total = 0;
        for _ in 0..5 {
            total += scan(&rules, &entries, &mut active).len();
        }
        assert_eq!(total, 1);
    }

    #[test]
    fn test_scan_realerts_after_reconnect() {
        let rules = port_rules(&[rule("ssh-probe", "22")]);
        let conn = parse_proc_net(&table(&[&row_established(22, 50000)]));
        let empty: Vec<ConnEntry> = Vec::new();
        let mut active = HashSet::new();

        assert_eq!(scan(&rules, &conn, &mut active).len(), 1);
        // Connection goes away, then the same peer reconnects.
        assert_eq!(scan(&rules, &empty, &mut active).len(), 0);
        assert_eq!(scan(&rules, &conn, &mut active).len(), 1);
    }

    #[test]
    fn test_scan_different_remote_ports_are_distinct() {
        let rules = port_rules(&[rule("ssh-probe", "22")]);
        let entries = parse_proc_net(&table(&[
            &row_established(22, 50000),
            &row_established(22, 50001),
        ]));
        let mut active = HashSet::new();
        assert_eq!(scan(&rules, &entries, &mut active).len(), 2);
    }

    #[test]
    fn test_scan_ignores_non_established() {
        let rules = port_rules(&[rule("ssh-probe", "22")]);
        // 0A is LISTEN.
        let listen =
            "   0: 0100007F:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000";
        let entries = parse_proc_net(&table(&[listen]));
        let mut active = HashSet::new();
        assert!(scan(&rules, &entries, &mut active).is_empty());
    }

    #[test]
    fn test_scan_multiple_rules() {
        let rules = port_rules(&[rule("ssh-probe", "22"), rule("web-probe", "8080")]);
        let entries = parse_proc_net(&table(&[
            &row_established(22, 50000),
            &row_established(8080, 50001),
            &row_established(9999, 50002),
        ]));
        let mut active = HashSet::new();
        let events = scan(&rules, &entries, &mut active);
        assert_eq!(events.len(), 2);
        let names: HashSet<&str> = events.iter().map(|e| e.rule_name.as_str()).collect();
        assert!(names.contains("ssh-probe"));
        assert!(names.contains("web-probe"));
    }

    #[test]
    fn test_event_detail_fields() {
        let rules = port_rules(&[rule("ssh-probe", "22")]);
        let entries = parse_proc_net(&table(&[&row_established(22, 50000)]));
        let mut active = HashSet::new();
        let events = scan(&rules, &entries, &mut active);

        let detail = &events[0].detail;
        assert_eq!(detail["local_port"], 22);
        assert_eq!(detail["remote_port"], 50000);
        assert_eq!(detail["remote_addr"], "127.0.0.1");
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].tripwire_type, TripwireType::Network);
    }

    #[test]
    fn test_invalid_rule_target_skipped() {
        let rules = [rule("good", "22"), rule("bad", "not-a-port"), rule("zero", "0")];
        let refs: Vec<&TripwireRule> = rules.iter().collect();
        let watcher =
            NetworkWatcher::with_source(&refs, Arc::new(ProcNetSource), DEFAULT_POLL_INTERVAL);
        assert_eq!(watcher.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_watcher_emits_and_stops() {
        let source = Arc::new(StubSource {
            tables: Mutex::new(vec![table(&[&row_established(22, 50000)])]),
        });
        let rules = [rule("ssh-probe", "22")];
        let refs: Vec<&TripwireRule> = rules.iter().collect();
        let mut watcher =
            NetworkWatcher::with_source(&refs, source, Duration::from_millis(10));

        let mut rx = watcher.start().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for alert")
            .expect("channel closed early");
        assert_eq!(event.rule_name, "ssh-probe");

        watcher.stop().await;
        // Channel drains and closes after stop.
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let rules = [rule("ssh-probe", "22")];
        let refs: Vec<&TripwireRule> = rules.iter().collect();
        let mut watcher = NetworkWatcher::with_source(
            &refs,
            Arc::new(ProcNetSource),
            Duration::from_secs(3600),
        );
        let _rx = watcher.start().await.unwrap();
        assert!(watcher.start().await.is_err());
        watcher.stop().await;
    }
}

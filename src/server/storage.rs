//! Server-side persistence for hosts and alerts
//!
//! Hosts are keyed by hostname: the first registration mints a UUID that
//! stays stable across agent restarts and reconnects. Alerts are keyed by
//! their client-generated alert_id, which makes ingestion idempotent
//! under at-least-once delivery.

use crate::alert::{Severity, TripwireType};
use crate::error::{Result, TripwireError};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

/// Host liveness as last observed by the collector. Registration always
/// moves a host back to Online; Offline and Degraded are set by
/// operators or external sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostStatus {
    Online,
    Offline,
    Degraded,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Degraded => "DEGRADED",
        }
    }
}

impl FromStr for HostStatus {
    type Err = TripwireError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ONLINE" => Ok(Self::Online),
            "OFFLINE" => Ok(Self::Offline),
            "DEGRADED" => Ok(Self::Degraded),
            other => Err(TripwireError::Validation(format!(
                "unknown host status {:?}",
                other
            ))),
        }
    }
}

/// A registered agent host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub hostname: String,
    pub platform: String,
    pub agent_version: String,
    pub status: HostStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A persisted alert, enriched with its origin host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAlert {
    pub alert_id: String,
    pub host_id: String,
    pub hostname: String,
    pub tripwire_type: TripwireType,
    pub rule_name: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Persistence boundary for the collector
///
/// Methods are synchronous; the embedded implementation below finishes in
/// microseconds, and the trait keeps the ingestion service testable with
/// in-memory fakes.
pub trait Store: Send + Sync {
    /// Register or refresh a host, returning its stable record. Repeated
    /// calls with the same hostname return the same id.
    fn upsert_host(&self, hostname: &str, platform: &str, agent_version: &str) -> Result<Host>;

    /// Persist an alert. Returns false when alert_id was already stored,
    /// which redelivered events routinely are.
    fn insert_alert(&self, alert: &StoredAlert) -> Result<bool>;

    /// Host record by id, if known
    fn host(&self, host_id: &str) -> Result<Option<Host>>;

    /// Update a host's liveness. Returns false for an unknown host_id.
    fn set_host_status(&self, host_id: &str, status: HostStatus) -> Result<bool>;

    /// Most recent alerts, newest first
    fn recent_alerts(&self, limit: usize) -> Result<Vec<StoredAlert>>;
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| TripwireError::Storage(format!("open database: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and ad-hoc runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TripwireError::Storage(format!("open database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| TripwireError::Storage(format!("set WAL mode: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| TripwireError::Storage(format!("set synchronous: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                id            TEXT PRIMARY KEY,
                hostname      TEXT NOT NULL UNIQUE,
                platform      TEXT NOT NULL,
                agent_version TEXT NOT NULL,
                status        TEXT NOT NULL,
                first_seen    INTEGER NOT NULL,
                last_seen     INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS alerts (
                alert_id      TEXT PRIMARY KEY,
                host_id       TEXT NOT NULL REFERENCES hosts (id),
                tripwire_type TEXT NOT NULL,
                rule_name     TEXT NOT NULL,
                severity      TEXT NOT NULL,
                timestamp     INTEGER NOT NULL,
                detail        TEXT NOT NULL,
                received_at   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_received
                ON alerts (received_at DESC);",
        )
        .map_err(|e| TripwireError::Storage(format!("create schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TripwireError::Storage("store lock poisoned".to_string()))
    }
}

fn micros_to_utc(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us).single().unwrap_or_default()
}

type HostRow = (String, String, String, String, String, i64, i64);

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl Store for SqliteStore {
    fn upsert_host(&self, hostname: &str, platform: &str, agent_version: &str) -> Result<Host> {
        let conn = self.lock()?;
        let now = Utc::now();
        let now_us = now.timestamp_micros();

        let existing = conn
            .query_row(
                "SELECT id, hostname, platform, agent_version, status, first_seen, last_seen
                 FROM hosts WHERE hostname = ?1",
                [hostname],
                row_to_host,
            )
            .optional()
            .map_err(|e| TripwireError::Storage(format!("select host: {}", e)))?;

        if let Some((id, hostname, _, _, _, first_seen, _)) = existing {
            // A registering agent is online by definition.
            conn.execute(
                "UPDATE hosts SET platform = ?1, agent_version = ?2, status = ?3,
                        last_seen = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    platform,
                    agent_version,
                    HostStatus::Online.as_str(),
                    now_us,
                    id
                ],
            )
            .map_err(|e| TripwireError::Storage(format!("refresh host: {}", e)))?;

            return Ok(Host {
                id,
                hostname,
                platform: platform.to_string(),
                agent_version: agent_version.to_string(),
                status: HostStatus::Online,
                first_seen: micros_to_utc(first_seen),
                last_seen: now,
            });
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO hosts (id, hostname, platform, agent_version, status,
                                first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![
                id,
                hostname,
                platform,
                agent_version,
                HostStatus::Online.as_str(),
                now_us
            ],
        )
        .map_err(|e| TripwireError::Storage(format!("insert host: {}", e)))?;

        Ok(Host {
            id,
            hostname: hostname.to_string(),
            platform: platform.to_string(),
            agent_version: agent_version.to_string(),
            status: HostStatus::Online,
            first_seen: now,
            last_seen: now,
        })
    }

    fn insert_alert(&self, alert: &StoredAlert) -> Result<bool> {
        let conn = self.lock()?;
        let detail = serde_json::to_string(&alert.detail)?;
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO alerts
                 (alert_id, host_id, tripwire_type, rule_name, severity,
                  timestamp, detail, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    alert.alert_id,
                    alert.host_id,
                    alert.tripwire_type.as_str(),
                    alert.rule_name,
                    alert.severity.as_str(),
                    alert.timestamp.timestamp_micros(),
                    detail,
                    alert.received_at.timestamp_micros(),
                ],
            )
            .map_err(|e| TripwireError::Storage(format!("insert alert: {}", e)))?;
        Ok(n > 0)
    }

    fn host(&self, host_id: &str) -> Result<Option<Host>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, hostname, platform, agent_version, status, first_seen, last_seen
                 FROM hosts WHERE id = ?1",
                [host_id],
                row_to_host,
            )
            .optional()
            .map_err(|e| TripwireError::Storage(format!("select host: {}", e)))?;

        match row {
            Some((id, hostname, platform, agent_version, status, first_seen, last_seen)) => {
                Ok(Some(Host {
                    id,
                    hostname,
                    platform,
                    agent_version,
                    status: HostStatus::from_str(&status)?,
                    first_seen: micros_to_utc(first_seen),
                    last_seen: micros_to_utc(last_seen),
                }))
            }
            None => Ok(None),
        }
    }

    fn set_host_status(&self, host_id: &str, status: HostStatus) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "UPDATE hosts SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.as_str(), host_id],
            )
            .map_err(|e| TripwireError::Storage(format!("update host status: {}", e)))?;
        Ok(n > 0)
    }

    fn recent_alerts(&self, limit: usize) -> Result<Vec<StoredAlert>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT a.alert_id, a.host_id, h.hostname, a.tripwire_type, a.rule_name,
                        a.severity, a.timestamp, a.detail, a.received_at
                 FROM alerts a JOIN hosts h ON h.id = a.host_id
                 ORDER BY a.received_at DESC LIMIT ?1",
            )
            .map_err(|e| TripwireError::Storage(format!("prepare query: {}", e)))?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .map_err(|e| TripwireError::Storage(format!("query alerts: {}", e)))?;

        let mut out = Vec::new();
        for row in rows {
            let (alert_id, host_id, hostname, ttype, rule_name, severity, ts, detail, recv) =
                row.map_err(|e| TripwireError::Storage(format!("read row: {}", e)))?;
            out.push(StoredAlert {
                alert_id,
                host_id,
                hostname,
                tripwire_type: TripwireType::from_str(&ttype)?,
                rule_name,
                severity: Severity::from_str(&severity)?,
                timestamp: micros_to_utc(ts),
                detail: serde_json::from_str(&detail)?,
                received_at: micros_to_utc(recv),
            });
        }
        Ok(out)
    }
}

//! Core alert types shared by the agent and the server
//!
//! `tripwire_type` and `severity` travel the wire as upper-case strings.
//! They are parsed exactly once at each trust boundary into the closed
//! enums below; internal code only ever handles the typed values.

use crate::error::{Result, TripwireError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Category of the sensor that produced an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TripwireType {
    File,
    Network,
    Process,
}

impl TripwireType {
    /// Wire representation (e.g. "NETWORK")
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "FILE",
            Self::Network => "NETWORK",
            Self::Process => "PROCESS",
        }
    }
}

impl fmt::Display for TripwireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripwireType {
    type Err = TripwireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(Self::File),
            "NETWORK" => Ok(Self::Network),
            "PROCESS" => Ok(Self::Process),
            other => Err(TripwireError::Validation(format!(
                "tripwire_type {:?} is invalid; must be FILE, NETWORK, or PROCESS",
                other
            ))),
        }
    }
}

/// Operator-configured urgency level of an alert or rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl Severity {
    /// Wire representation (e.g. "CRITICAL")
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = TripwireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(TripwireError::Validation(format!(
                "severity {:?} is invalid; must be INFO, WARN, or CRITICAL",
                other
            ))),
        }
    }
}

/// A single detection emitted by a watcher
///
/// Immutable once created. The queue, transport, and audit logger each
/// consume their own clone independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Globally unique id, minted at creation. Survives queueing and
    /// redelivery, so the server can deduplicate retried sends.
    pub alert_id: Uuid,

    /// Sensor category that produced this event
    pub tripwire_type: TripwireType,

    /// Name of the rule that triggered this event
    pub rule_name: String,

    /// Urgency copied from the triggering rule
    pub severity: Severity,

    /// When the event occurred on the agent host
    pub timestamp: DateTime<Utc>,

    /// Type-specific metadata (file path, pid, source IP, ports, ...)
    #[serde(default)]
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl AlertEvent {
    /// Create an event stamped with the current time
    pub fn new(
        tripwire_type: TripwireType,
        rule_name: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            tripwire_type,
            rule_name: rule_name.into(),
            severity,
            timestamp: Utc::now(),
            detail: serde_json::Map::new(),
        }
    }

    /// Add a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }

    /// Serialize the detail map, or JSON null when empty
    pub fn detail_json(&self) -> Vec<u8> {
        if self.detail.is_empty() {
            return Vec::new();
        }
        serde_json::to_vec(&self.detail).unwrap_or_default()
    }
}

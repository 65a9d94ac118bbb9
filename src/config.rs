//! Agent configuration loading and validation
//!
//! The agent is configured from a single YAML file. Loading applies
//! defaults for optional fields and then validates every required field,
//! collecting all failures into one error so operators can fix a broken
//! config in a single pass.

use crate::alert::{Severity, TripwireType};
use crate::error::{Result, TripwireError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Dashboard gRPC endpoint, e.g. "https://dashboard.example.com:4443"
    pub dashboard_addr: String,

    /// mTLS certificate material
    pub tls: TlsConfig,

    /// Tripwire rules the agent should enforce
    #[serde(default)]
    pub rules: Vec<TripwireRule>,

    /// Minimum log severity: "debug", "info", "warn", or "error"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listen address for the /healthz HTTP server
    #[serde(default = "default_health_addr")]
    pub health_addr: String,

    /// Version string sent to the dashboard during registration
    #[serde(default)]
    pub agent_version: String,

    /// Path of the durable alert queue database
    #[serde(default = "default_queue_path")]
    pub queue_path: String,

    /// Path of the tamper-evident audit log
    #[serde(default = "default_audit_path")]
    pub audit_path: String,
}

/// Certificate and key paths for mTLS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded client certificate
    pub cert_path: String,
    /// PEM-encoded client private key
    pub key_path: String,
    /// PEM-encoded CA certificate that signed both peers
    pub ca_path: String,
}

/// A single file, network, or process tripwire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripwireRule {
    /// Human-readable rule identifier, e.g. "etc-passwd-watch"
    pub name: String,

    /// One of "FILE", "NETWORK", or "PROCESS"
    #[serde(rename = "type")]
    pub rule_type: String,

    /// Rule-specific target: a path for FILE rules, a decimal port for
    /// NETWORK rules, a process name for PROCESS rules
    pub target: String,

    /// One of "INFO", "WARN", or "CRITICAL"
    pub severity: String,
}

impl TripwireRule {
    /// Parse the rule's type string into the closed enum
    pub fn parsed_type(&self) -> Result<TripwireType> {
        TripwireType::from_str(&self.rule_type)
    }

    /// Parse the rule's severity string into the closed enum
    pub fn parsed_severity(&self) -> Result<Severity> {
        Severity::from_str(&self.severity)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_queue_path() -> String {
    "tripwire-queue.db".to_string()
}

fn default_audit_path() -> String {
    "tripwire-audit.log".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

impl AgentConfig {
    /// Load, default, and validate the YAML config at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TripwireError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
            .map_err(|e| TripwireError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate a YAML config string
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: AgentConfig = serde_yaml::from_str(raw)
            .map_err(|e| TripwireError::Config(format!("cannot parse YAML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check required fields and enumerated values, collecting every
    /// failure into one error message
    fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();

        if self.dashboard_addr.is_empty() {
            errs.push("dashboard_addr is required".to_string());
        }
        if self.tls.cert_path.is_empty() {
            errs.push("tls.cert_path is required".to_string());
        }
        if self.tls.key_path.is_empty() {
            errs.push("tls.key_path is required".to_string());
        }
        if self.tls.ca_path.is_empty() {
            errs.push("tls.ca_path is required".to_string());
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            errs.push(format!(
                "log_level {:?} must be one of: debug, info, warn, error",
                self.log_level
            ));
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.is_empty() {
                errs.push(format!("rules[{}]: name is required", i));
            }
            if rule.parsed_type().is_err() {
                errs.push(format!(
                    "rules[{}]: type {:?} must be one of: FILE, NETWORK, PROCESS",
                    i, rule.rule_type
                ));
            }
            if rule.target.is_empty() {
                errs.push(format!("rules[{}]: target is required", i));
            }
            if rule.parsed_severity().is_err() {
                errs.push(format!(
                    "rules[{}]: severity {:?} must be one of: INFO, WARN, CRITICAL",
                    i, rule.severity
                ));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(TripwireError::Config(errs.join("; ")))
        }
    }

    /// Rules of a given type, in config order
    pub fn rules_of_type(&self, t: TripwireType) -> Vec<&TripwireRule> {
        self.rules
            .iter()
            .filter(|r| r.parsed_type().map(|rt| rt == t).unwrap_or(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
dashboard_addr: "https://dash.example.com:4443"
tls:
  cert_path: /etc/tripwire/agent.pem
  key_path: /etc/tripwire/agent.key
  ca_path: /etc/tripwire/ca.pem
rules:
  - name: ssh-probe
    type: NETWORK
    target: "22"
    severity: CRITICAL
  - name: etc-passwd-watch
    type: FILE
    target: /etc/passwd
    severity: WARN
"#;

    #[test]
    fn test_load_valid_config() {
        let cfg = AgentConfig::from_yaml(VALID).unwrap();
        assert_eq!(cfg.dashboard_addr, "https://dash.example.com:4443");
        assert_eq!(cfg.rules.len(), 2);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.health_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_rule_parsing() {
        let cfg = AgentConfig::from_yaml(VALID).unwrap();
        assert_eq!(cfg.rules[0].parsed_type().unwrap(), TripwireType::Network);
        assert_eq!(cfg.rules[0].parsed_severity().unwrap(), Severity::Critical);
    }

    #[test]
    fn test_rules_of_type() {
        let cfg = AgentConfig::from_yaml(VALID).unwrap();
        let network = cfg.rules_of_type(TripwireType::Network);
        assert_eq!(network.len(), 1);
        assert_eq!(network[0].name, "ssh-probe");
        assert!(cfg.rules_of_type(TripwireType::Process).is_empty());
    }

    #[test]
    fn test_missing_required_fields() {
        let yaml = r#"
dashboard_addr: ""
tls:
  cert_path: ""
  key_path: ""
  ca_path: ""
"#;
        let err = AgentConfig::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("dashboard_addr is required"));
        assert!(err.contains("tls.cert_path is required"));
        assert!(err.contains("tls.key_path is required"));
        assert!(err.contains("tls.ca_path is required"));
    }

    #[test]
    fn test_invalid_rule_enum_values() {
        let yaml = r#"
dashboard_addr: "https://dash:4443"
tls:
  cert_path: a
  key_path: b
  ca_path: c
rules:
  - name: bad
    type: SOCKET
    target: "80"
    severity: PANIC
"#;
        let err = AgentConfig::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("rules[0]: type"));
        assert!(err.contains("rules[0]: severity"));
    }

    #[test]
    fn test_invalid_log_level() {
        let yaml = VALID.replace(
            "rules:",
            "log_level: verbose\nrules:",
        );
        let err = AgentConfig::from_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("log_level"));
    }
}

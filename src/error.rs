//! Error types for tripwire

use thiserror::Error;

/// Errors that can occur in the agent and server cores
#[derive(Debug, Error)]
pub enum TripwireError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Watcher sensor error
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Local queue failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// Operation attempted on a closed queue
    #[error("Queue is closed")]
    QueueClosed,

    /// Audit log integrity failure (broken chain or hash mismatch)
    #[error("Audit integrity error at seq {seq}: {reason}")]
    AuditIntegrity { seq: u64, reason: String },

    /// Audit log I/O or encoding failure
    #[error("Audit error: {0}")]
    Audit(String),

    /// Transport connection or stream failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Send attempted before Start or after Stop
    #[error("Transport is not running")]
    TransportClosed,

    /// Outbound event buffer full (back-pressure from a slow stream)
    #[error("Transport send buffer full, event will be delivered via queue")]
    TransportBusy,

    /// Server-side storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Per-event validation failure at the ingestion boundary
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tripwire operations
pub type Result<T> = std::result::Result<T, TripwireError>;

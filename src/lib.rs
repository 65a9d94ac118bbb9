//! TripWire: host intrusion detection agent and alert collector
//!
//! The agent watches for file, network, and process tripwires, records
//! every detection in a tamper-evident audit log, buffers it in a
//! crash-safe local queue, and streams it to the dashboard collector
//! over mutually authenticated gRPC with at-least-once delivery. The
//! collector validates, persists, and fans alerts out to live
//! subscribers without ever letting a slow consumer stall ingestion.

pub mod agent;
pub mod alert;
pub mod audit;
pub mod config;
pub mod error;
pub mod queue;
pub mod server;
pub mod transport;
pub mod watcher;

/// Generated protobuf/gRPC types for the agent-dashboard wire protocol
pub mod pb {
    tonic::include_proto!("tripwire.alert");
}

pub use alert::{AlertEvent, Severity, TripwireType};
pub use error::{Result, TripwireError};

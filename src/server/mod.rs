//! Dashboard collector: gRPC ingestion, persistence, and live fan-out

pub mod broadcaster;
pub mod service;
pub mod storage;

use crate::error::{Result, TripwireError};
use std::path::Path;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Build the mTLS acceptor config: present our identity, and require a
/// client certificate signed by the shared CA. Connections without a
/// certificate, or with one from another authority, fail the handshake.
pub fn tls_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    ca_path: impl AsRef<Path>,
) -> Result<ServerTlsConfig> {
    let cert = std::fs::read(cert_path.as_ref()).map_err(|e| {
        TripwireError::Config(format!("read {}: {}", cert_path.as_ref().display(), e))
    })?;
    let key = std::fs::read(key_path.as_ref()).map_err(|e| {
        TripwireError::Config(format!("read {}: {}", key_path.as_ref().display(), e))
    })?;
    let ca = std::fs::read(ca_path.as_ref()).map_err(|e| {
        TripwireError::Config(format!("read {}: {}", ca_path.as_ref().display(), e))
    })?;

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

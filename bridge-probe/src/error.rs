//! Probe failures, one variant per stage

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Cannot reach proxy {endpoint}: {source}")]
    ProxyUnreachable {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Timed out after {elapsed:?} while {stage}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },

    #[error("SOCKS5 handshake failed: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("HTTP CONNECT rejected: {status}")]
    HttpConnect { status: String },

    #[error("Proxy sent a malformed response: {0}")]
    MalformedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Diagnostics for the upstream proxy
//!
//! [`test_connection`] is a control-surface operation. It performs real
//! network I/O and must never be called from the classification path.

pub mod error;
pub mod http_connect;
pub mod probe;
pub mod socks5;

pub use error::{ProbeError, Result};
pub use probe::{test_connection, test_connection_with_timeout, Probe, DEFAULT_TIMEOUT};

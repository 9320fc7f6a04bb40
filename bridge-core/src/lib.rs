//! Control surface for the proxy bridge
//!
//! Wraps the rule table, the upstream proxy and a capture session behind
//! [`ProxyBridge`], and defines the [`CaptureDriver`] boundary.

pub mod args;
pub mod bridge;
pub mod driver;
pub mod error;

pub use args::CommonArgs;
pub use bridge::{ProxyBridge, SessionInfo, SessionOptions};
pub use driver::CaptureDriver;
pub use error::{BridgeError, Result};

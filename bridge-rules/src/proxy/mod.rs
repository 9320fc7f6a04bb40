//! Upstream proxy configuration

pub mod config;
mod input;

pub use config::{ProxyConfig, ProxyKind};

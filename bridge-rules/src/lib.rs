//! Per-connection routing rules for a transparent proxy redirector
//!
//! Rules select connections by originating process, destination host,
//! destination port and transport, and decide whether each goes through
//! the upstream proxy, goes direct, or is blocked.

pub mod config;
pub mod error;
pub mod filter;
pub mod proxy;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigValidator};
pub use error::{ClassifierFault, PatternError, Result, RuleError};
pub use filter::{
    Action, Classifier, ConnectionAttempt, Decision, Protocol, RoutingOptions, Rule, RuleId,
    RuleSpec, RuleTable, SelfExclusionGuard, Transport, Verdict,
};
pub use proxy::{ProxyConfig, ProxyKind};

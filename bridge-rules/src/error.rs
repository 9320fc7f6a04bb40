//! Error types for rule and classifier operations

use crate::filter::rule::RuleId;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("Invalid pattern in rule {index}: {source}")]
    InvalidRulePattern {
        index: usize,
        #[source]
        source: PatternError,
    },

    #[error("Rule not found: {id}")]
    RuleNotFound { id: RuleId },

    #[error("Failed to install proxy exclusion rule for {host}: {reason}")]
    ExclusionInstallFailed { host: String, reason: String },

    #[error("Proxy exclusion for {host} is still required by global PROXY rule {rule}")]
    ExclusionRequired { host: String, rule: RuleId },

    #[error("Rule id space exhausted")]
    IdExhausted,

    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Empty {field} pattern")]
    Empty { field: &'static str },

    #[error("Invalid process pattern: {pattern}")]
    InvalidProcess { pattern: String },

    #[error("Invalid host pattern: {pattern}")]
    InvalidHost { pattern: String },

    #[error("Invalid port pattern: {pattern}")]
    InvalidPort { pattern: String },
}

/// Internal faults on the classification hot path.
///
/// These never propagate past `Classifier::classify`; they are counted,
/// logged and replaced by a DIRECT decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierFault {
    #[error("Rule {rule} requested PROXY but no proxy is configured")]
    ProxyUnavailable { rule: String },
}

//! Configuration schema types

use crate::error::{Result, RuleError};
use crate::filter::rule::{Action, RuleSpec};
use crate::filter::snapshot::RoutingOptions;
use crate::proxy::{ProxyConfig, ProxyKind};
use serde::{Deserialize, Serialize};

/// Complete configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: Option<ProxySection>,
    #[serde(default)]
    pub options: OptionsSection,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// `[proxy]`: either a `url` or discrete fields
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxySection {
    /// Any form accepted by [`ProxyConfig::parse`]
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub kind: Option<ProxyKind>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxySection {
    pub fn to_proxy_config(&self) -> Result<ProxyConfig> {
        if let Some(url) = &self.url {
            if self.host.is_some() || self.port.is_some() {
                return Err(RuleError::ConfigError(
                    "[proxy] takes either url or host/port, not both".to_string(),
                ));
            }
            return ProxyConfig::parse(url);
        }

        let host = self
            .host
            .as_deref()
            .ok_or_else(|| RuleError::ConfigError("[proxy] is missing host".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| RuleError::ConfigError("[proxy] is missing port".to_string()))?;

        let config = ProxyConfig::new(self.kind.unwrap_or_default(), host, port)
            .with_credentials(self.username.clone(), self.password.clone());
        config.validate()?;
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

/// `[options]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct OptionsSection {
    #[serde(default)]
    pub default_action: Action,
    #[serde(default)]
    pub dns_via_proxy: bool,
    #[serde(default = "default_true")]
    pub disable_udp: bool,
    /// Prepend the built-in local network DIRECT rules
    #[serde(default = "default_true")]
    pub bypass_local: bool,
}

impl Default for OptionsSection {
    fn default() -> Self {
        Self {
            default_action: Action::Direct,
            dns_via_proxy: false,
            disable_udp: true,
            bypass_local: true,
        }
    }
}

impl OptionsSection {
    pub fn routing(&self) -> RoutingOptions {
        RoutingOptions {
            default_action: self.default_action,
            dns_via_proxy: self.dns_via_proxy,
            disable_udp: self.disable_udp,
        }
    }
}

impl Config {
    /// Resolve the `[proxy]` section, if any
    pub fn proxy_config(&self) -> Result<Option<ProxyConfig>> {
        self.proxy
            .as_ref()
            .map(ProxySection::to_proxy_config)
            .transpose()
    }
}

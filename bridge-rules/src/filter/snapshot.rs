//! Immutable point-in-time view of the rule set

use super::rule::{Action, Rule, RuleId};
use crate::proxy::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

fn default_true() -> bool {
    true
}

/// Flags consulted after rule matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoutingOptions {
    /// Decision when no rule matches
    #[serde(default)]
    pub default_action: Action,
    /// Tunnel DNS (port 53) when a rule says PROXY
    #[serde(default)]
    pub dns_via_proxy: bool,
    /// Never hand UDP to the relay
    #[serde(default = "default_true")]
    pub disable_udp: bool,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            default_action: Action::Direct,
            dns_via_proxy: false,
            disable_udp: true,
        }
    }
}

/// The pinned DIRECT rule protecting the upstream proxy's own addresses
#[derive(Debug, Clone)]
pub struct Exclusion {
    pub rule: Rule,
    /// Host the addresses were derived from
    pub proxy_host: String,
    pub addrs: Vec<IpAddr>,
}

/// Everything one classification call needs, published as a unit
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub(crate) version: u64,
    pub(crate) exclusion: Option<Arc<Exclusion>>,
    /// Ordinary rules in ascending id order
    pub(crate) rules: Vec<Arc<Rule>>,
    pub(crate) proxy: Option<Arc<ProxyConfig>>,
    /// Addresses the proxy host resolved to when it was activated
    pub(crate) proxy_addrs: Vec<IpAddr>,
    pub(crate) options: RoutingOptions,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn options(&self) -> &RoutingOptions {
        &self.options
    }

    pub fn proxy(&self) -> Option<&Arc<ProxyConfig>> {
        self.proxy.as_ref()
    }

    pub fn exclusion(&self) -> Option<&Exclusion> {
        self.exclusion.as_deref()
    }

    /// Ordinary rules, oldest first
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|rule| rule.as_ref())
    }

    /// Rules in evaluation order: the exclusion rule, then ordinary rules
    pub fn evaluation_order(&self) -> impl Iterator<Item = &Rule> {
        self.exclusion
            .iter()
            .map(|exclusion| &exclusion.rule)
            .chain(self.rules())
    }

    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.position(id).map(|index| self.rules[index].as_ref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn proxy_addrs(&self) -> &[IpAddr] {
        &self.proxy_addrs
    }

    /// True unless a proxy is active without an exclusion covering every
    /// address it resolved to
    pub fn proxy_protected(&self) -> bool {
        match (&self.proxy, &self.exclusion) {
            (None, _) => true,
            (Some(proxy), Some(exclusion)) if self.proxy_addrs.is_empty() => {
                exclusion.proxy_host == proxy.host.trim()
            }
            (Some(_), Some(exclusion)) => self
                .proxy_addrs
                .iter()
                .all(|addr| exclusion.addrs.contains(addr)),
            (Some(_), None) => false,
        }
    }

    pub(crate) fn position(&self, id: RuleId) -> Option<usize> {
        self.rules.binary_search_by_key(&id, |rule| rule.id).ok()
    }
}

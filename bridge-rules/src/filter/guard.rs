//! Self-exclusion guard
//!
//! Once a catch-all rule sends everything to PROXY, the relay's own
//! connection to the upstream would be classified PROXY as well and loop.
//! The guard keeps a pinned DIRECT rule for the upstream's addresses that
//! is evaluated before every ordinary rule, and refuses global PROXY rules
//! while that protection is missing.

use super::rule::{Rule, RuleId};
use super::snapshot::{Exclusion, Snapshot};
use super::table::RuleTable;
use crate::error::{Result, RuleError};
use crate::proxy::ProxyConfig;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Reject a rule that would route the upstream's own traffic into itself
pub(crate) fn admit(snapshot: &Snapshot, rule: &Rule) -> Result<()> {
    if !rule.enabled || !rule.is_global_proxy() || snapshot.proxy_protected() {
        return Ok(());
    }

    let host = snapshot
        .proxy()
        .map(|proxy| proxy.host.clone())
        .unwrap_or_default();
    warn!(rule = %rule.id, proxy = %host, "Refusing global PROXY rule without proxy exclusion");
    Err(RuleError::ExclusionInstallFailed {
        host,
        reason: "no exclusion rule covers the active proxy".to_string(),
    })
}

/// Reject an exclusion change that leaves an enabled global PROXY rule
/// routing the upstream's own traffic
pub(crate) fn ensure_protected(snapshot: &Snapshot) -> Result<()> {
    if snapshot.proxy_protected() {
        return Ok(());
    }
    let Some(rule) = snapshot
        .rules()
        .find(|rule| rule.enabled && rule.is_global_proxy())
    else {
        return Ok(());
    };

    let host = snapshot
        .proxy()
        .map(|proxy| proxy.host.clone())
        .unwrap_or_default();
    warn!(rule = %rule.id, proxy = %host, "Refusing to leave the active proxy without exclusion");
    Err(RuleError::ExclusionRequired { host, rule: rule.id })
}

/// Owns the pinned exclusion rule of a [`RuleTable`]
#[derive(Clone)]
pub struct SelfExclusionGuard {
    table: Arc<RuleTable>,
}

impl SelfExclusionGuard {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self { table }
    }

    /// Insert or replace the exclusion for a single upstream address
    pub fn install(&self, proxy_ip: IpAddr) -> Result<RuleId> {
        let id = self
            .table
            .install_exclusion(&proxy_ip.to_string(), vec![proxy_ip])?;
        info!(rule = %id, proxy = %proxy_ip, "Proxy exclusion installed");
        Ok(id)
    }

    /// Resolve `config` and insert or replace the exclusion for all its addresses
    pub fn install_for(&self, config: &ProxyConfig) -> Result<RuleId> {
        let addrs = config.resolve_addrs()?;
        let id = self.table.install_exclusion(&config.host, addrs)?;
        info!(rule = %id, proxy = %config.host, "Proxy exclusion installed");
        Ok(id)
    }

    /// Make `config` the active upstream.
    ///
    /// The exclusion is derived first; the new upstream and its exclusion
    /// are then published together. On failure nothing changes.
    pub fn activate(&self, config: ProxyConfig) -> Result<RuleId> {
        config.validate()?;
        let addrs = config.resolve_addrs().map_err(|e| {
            warn!(proxy = %config.host, error = %e, "Cannot derive proxy exclusion");
            e
        })?;

        let host = config.host.clone();
        let id = self.table.replace_proxy(config, addrs)?;
        info!(rule = %id, proxy = %host, "Proxy activated");
        Ok(id)
    }

    /// Drop the upstream together with its exclusion
    pub fn deactivate(&self) -> bool {
        let had_proxy = self.table.clear_proxy();
        if had_proxy {
            info!("Proxy deactivated");
        }
        had_proxy
    }

    /// Delete the exclusion rule, leaving any upstream in place.
    ///
    /// Refused with [`RuleError::ExclusionRequired`] while a proxy is active
    /// and an enabled global PROXY rule depends on the exclusion.
    pub fn remove(&self) -> Result<bool> {
        let removed = self.table.remove_exclusion()?;
        if removed {
            info!("Proxy exclusion removed");
        }
        Ok(removed)
    }

    pub fn installed(&self) -> Option<Exclusion> {
        self.table.load().exclusion().cloned()
    }
}

//! Copy-on-write rule table
//!
//! Readers load the current [`Snapshot`] with a single atomic operation
//! and never lock. Writers are serialized by a mutex, build a modified
//! copy of the snapshot and publish it with one atomic store, so a
//! reader sees either the whole edit or none of it.

use super::guard;
use super::rule::{Rule, RuleId, RuleSpec};
use super::snapshot::{Exclusion, RoutingOptions, Snapshot};
use crate::error::{Result, RuleError};
use crate::proxy::ProxyConfig;
use arc_swap::{ArcSwap, Guard};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Writer-side state that is not part of the published snapshot
struct Writer {
    next_id: u32,
}

impl Writer {
    fn peek_id(&self) -> Result<RuleId> {
        RuleId::new(self.next_id).ok_or(RuleError::IdExhausted)
    }

    fn commit_id(&mut self) -> Result<()> {
        self.next_id = self.next_id.checked_add(1).ok_or(RuleError::IdExhausted)?;
        Ok(())
    }

    fn allocate(&mut self) -> Result<RuleId> {
        let id = self.peek_id()?;
        self.commit_id()?;
        Ok(id)
    }
}

/// Ordered, concurrently readable rule collection
pub struct RuleTable {
    current: ArcSwap<Snapshot>,
    writer: Mutex<Writer>,
}

impl RuleTable {
    pub fn new(options: RoutingOptions) -> Self {
        let snapshot = Snapshot {
            options,
            ..Snapshot::default()
        };
        Self {
            current: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(Writer { next_id: 1 }),
        }
    }

    /// Build a table from a loaded rule list; all rules or none
    pub fn with_rules(options: RoutingOptions, specs: &[RuleSpec]) -> Result<Self> {
        let table = Self::new(options);
        table.add_all(specs)?;
        Ok(table)
    }

    /// Lock-free view for the hot path
    pub fn load(&self) -> Guard<Arc<Snapshot>> {
        self.current.load()
    }

    /// Owned view that may outlive later mutations
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Ordinary rules in evaluation order
    pub fn rules(&self) -> Vec<Rule> {
        self.current.load().rules().cloned().collect()
    }

    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.current.load().get(id).cloned()
    }

    pub fn proxy(&self) -> Option<Arc<ProxyConfig>> {
        self.current.load().proxy().cloned()
    }

    pub fn options(&self) -> RoutingOptions {
        *self.current.load().options()
    }

    /// Append a rule and return its freshly allocated id
    pub fn add(&self, spec: &RuleSpec) -> Result<RuleId> {
        let id = self.update(|next, writer| {
            let id = writer.peek_id()?;
            let rule = Rule::compile(id, spec)?;
            guard::admit(next, &rule)?;
            writer.commit_id()?;
            next.rules.push(Arc::new(rule));
            Ok(id)
        })?;

        info!(rule = %id, process = %spec.process, hosts = %spec.hosts, ports = %spec.ports, action = %spec.action, "Rule added");
        Ok(id)
    }

    /// Append several rules in one publication
    pub fn add_all(&self, specs: &[RuleSpec]) -> Result<Vec<RuleId>> {
        let ids = self.update(|next, writer| {
            let first = writer.next_id;
            let mut ids = Vec::with_capacity(specs.len());
            for spec in specs {
                let id = writer.allocate()?;
                let rule = match Rule::compile(id, spec)
                    .map_err(RuleError::from)
                    .and_then(|rule| guard::admit(next, &rule).map(|_| rule))
                {
                    Ok(rule) => rule,
                    Err(e) => {
                        writer.next_id = first;
                        return Err(e);
                    }
                };
                next.rules.push(Arc::new(rule));
                ids.push(id);
            }
            Ok(ids)
        })?;

        if !ids.is_empty() {
            info!(count = ids.len(), "Rules added");
        }
        Ok(ids)
    }

    /// Replace a rule's patterns, protocol, action and enabled flag in place
    pub fn edit(&self, id: RuleId, spec: &RuleSpec) -> Result<()> {
        self.update(|next, _| {
            let index = next.position(id).ok_or(RuleError::RuleNotFound { id })?;
            let rule = Rule::compile(id, spec)?;
            guard::admit(next, &rule)?;
            next.rules[index] = Arc::new(rule);
            Ok(())
        })?;

        info!(rule = %id, "Rule edited");
        Ok(())
    }

    pub fn delete(&self, id: RuleId) -> Result<()> {
        self.update(|next, _| {
            let index = next.position(id).ok_or(RuleError::RuleNotFound { id })?;
            next.rules.remove(index);
            Ok(())
        })?;

        info!(rule = %id, "Rule deleted");
        Ok(())
    }

    pub fn enable(&self, id: RuleId) -> Result<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: RuleId) -> Result<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<()> {
        self.update(|next, _| {
            let index = next.position(id).ok_or(RuleError::RuleNotFound { id })?;
            if next.rules[index].enabled == enabled {
                return Ok(());
            }
            let mut rule = Rule::clone(&next.rules[index]);
            rule.enabled = enabled;
            guard::admit(next, &rule)?;
            next.rules[index] = Arc::new(rule);
            Ok(())
        })?;

        debug!(rule = %id, enabled, "Rule state changed");
        Ok(())
    }

    pub fn set_options(&self, options: RoutingOptions) {
        self.update_options(|current| *current = options);
    }

    /// Read-modify-write of the routing options under the writer lock
    pub fn update_options(&self, f: impl FnOnce(&mut RoutingOptions)) -> RoutingOptions {
        let mut applied = RoutingOptions::default();
        // The closure cannot fail
        let _ = self.update(|next, _| {
            f(&mut next.options);
            applied = next.options;
            Ok(())
        });
        info!(options = ?applied, "Routing options updated");
        applied
    }

    /// Install or replace the pinned exclusion rule
    pub(crate) fn install_exclusion(&self, proxy_host: &str, addrs: Vec<IpAddr>) -> Result<RuleId> {
        self.update(|next, writer| {
            let id = writer.peek_id()?;
            next.exclusion = Some(Arc::new(Exclusion {
                rule: Rule::exclusion(id, &addrs),
                proxy_host: proxy_host.trim().to_string(),
                addrs,
            }));
            guard::ensure_protected(next)?;
            writer.commit_id()?;
            Ok(id)
        })
    }

    /// Drop the pinned exclusion rule; refused while a global PROXY rule needs it
    pub(crate) fn remove_exclusion(&self) -> Result<bool> {
        self.update(|next, _| {
            let removed = next.exclusion.take().is_some();
            guard::ensure_protected(next)?;
            Ok(removed)
        })
    }

    /// Publish a new upstream together with its exclusion in one snapshot
    pub(crate) fn replace_proxy(
        &self,
        proxy: ProxyConfig,
        addrs: Vec<IpAddr>,
    ) -> Result<RuleId> {
        self.update(|next, writer| {
            let host = proxy.host.trim().to_string();
            let reusable = next
                .exclusion
                .as_ref()
                .filter(|current| current.proxy_host == host && current.addrs == addrs)
                .map(|current| current.rule.id);

            let id = match reusable {
                Some(id) => id,
                None => {
                    let id = writer.allocate()?;
                    next.exclusion = Some(Arc::new(Exclusion {
                        rule: Rule::exclusion(id, &addrs),
                        proxy_host: host,
                        addrs,
                    }));
                    id
                }
            };

            next.proxy = Some(Arc::new(proxy));
            next.proxy_addrs = next
                .exclusion
                .as_ref()
                .map(|exclusion| exclusion.addrs.clone())
                .unwrap_or_default();
            Ok(id)
        })
    }

    /// Drop the upstream and its exclusion in one snapshot
    pub(crate) fn clear_proxy(&self) -> bool {
        self.update(|next, _| {
            let had_proxy = next.proxy.take().is_some();
            next.proxy_addrs.clear();
            next.exclusion = None;
            Ok(had_proxy)
        })
        .unwrap_or(false)
    }

    /// Serialize writers, apply `f` to a copy and publish it on success
    fn update<T>(&self, f: impl FnOnce(&mut Snapshot, &mut Writer) -> Result<T>) -> Result<T> {
        // The published snapshot is only replaced after `f` succeeds, so a
        // poisoned lock still guards consistent state.
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&self.current.load());
        let out = f(&mut next, &mut writer)?;
        next.version += 1;
        self.current.store(Arc::new(next));
        Ok(out)
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(RoutingOptions::default())
    }
}

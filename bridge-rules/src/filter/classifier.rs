//! Connection classifier
//!
//! Maps a connection attempt to PROXY, DIRECT or BLOCK by scanning one
//! snapshot of the rule table in evaluation order. First match wins; when
//! nothing matches the configured default action applies.
//!
//! Classification never fails. Internal faults fall back to DIRECT and are
//! counted and logged.

use super::events::ConnectionObserver;
use super::pattern::normalize_process_name;
use super::rule::{Action, RuleId, Transport};
use super::snapshot::Snapshot;
use super::table::RuleTable;
use crate::error::ClassifierFault;
use crate::proxy::ProxyConfig;
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

const DNS_PORT: u16 = 53;

/// A connection observed by the capture component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    /// Executable name or full path of the originating process
    pub process_name: String,
    pub process_id: u32,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub protocol: Transport,
    /// Destination hostname when the capture layer knows it
    pub dest_host: Option<String>,
}

impl ConnectionAttempt {
    pub fn new(
        process_name: impl Into<String>,
        process_id: u32,
        dest_ip: IpAddr,
        dest_port: u16,
        protocol: Transport,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            process_id,
            dest_ip,
            dest_port,
            protocol,
            dest_host: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.dest_host = Some(host.into());
        self
    }
}

/// Routing decision handed back to the capture component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proxy(Arc<ProxyConfig>),
    Direct,
    Block,
}

impl Decision {
    pub fn action(&self) -> Action {
        match self {
            Decision::Proxy(_) => Action::Proxy,
            Decision::Direct => Action::Direct,
            Decision::Block => Action::Block,
        }
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        match self {
            Decision::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Proxy(proxy) => write!(f, "PROXY {}", proxy),
            Decision::Direct => write!(f, "DIRECT"),
            Decision::Block => write!(f, "BLOCK"),
        }
    }
}

/// Where a verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Rule(RuleId),
    Default,
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchSource::Rule(id) => write!(f, "rule #{}", id),
            MatchSource::Default => write!(f, "default action"),
        }
    }
}

/// Why a PROXY verdict was turned into DIRECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjustment {
    /// UDP relay disabled, or the upstream cannot carry UDP
    UdpNotRelayed,
    /// DNS stays off the tunnel unless explicitly routed through it
    DnsDirect,
    Fault(ClassifierFault),
}

/// Decision plus the provenance needed for logging and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub source: MatchSource,
    pub adjustment: Option<Adjustment>,
}

impl Verdict {
    pub fn rule_id(&self) -> Option<RuleId> {
        match self.source {
            MatchSource::Rule(id) => Some(id),
            MatchSource::Default => None,
        }
    }

    pub fn fault(&self) -> Option<&ClassifierFault> {
        match &self.adjustment {
            Some(Adjustment::Fault(fault)) => Some(fault),
            _ => None,
        }
    }

    fn direct(source: MatchSource, adjustment: Adjustment) -> Self {
        Self {
            decision: Decision::Direct,
            source,
            adjustment: Some(adjustment),
        }
    }
}

/// Evaluate `attempt` against one snapshot
pub fn evaluate(snapshot: &Snapshot, attempt: &ConnectionAttempt) -> Verdict {
    let process = normalize_process_name(&attempt.process_name);
    let hostname = attempt.dest_host.as_deref().map(|host| {
        let host = host.trim().trim_end_matches('.');
        if host.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(host.to_ascii_lowercase())
        } else {
            Cow::Borrowed(host)
        }
    });

    let options = snapshot.options();
    let (action, source) = snapshot
        .evaluation_order()
        .find(|rule| {
            rule.matches(
                &process,
                attempt.dest_ip,
                hostname.as_deref(),
                attempt.dest_port,
                attempt.protocol,
            )
        })
        .map(|rule| (rule.action, MatchSource::Rule(rule.id)))
        .unwrap_or((options.default_action, MatchSource::Default));

    let decision = match action {
        Action::Direct => Decision::Direct,
        Action::Block => Decision::Block,
        Action::Proxy => {
            let Some(proxy) = snapshot.proxy() else {
                return Verdict::direct(
                    source,
                    Adjustment::Fault(ClassifierFault::ProxyUnavailable {
                        rule: source.to_string(),
                    }),
                );
            };

            if attempt.protocol == Transport::Udp
                && (options.disable_udp || !proxy.kind.supports_udp())
            {
                return Verdict::direct(source, Adjustment::UdpNotRelayed);
            }
            if attempt.dest_port == DNS_PORT && !options.dns_via_proxy {
                return Verdict::direct(source, Adjustment::DnsDirect);
            }
            Decision::Proxy(proxy.clone())
        }
    };

    Verdict {
        decision,
        source,
        adjustment: None,
    }
}

/// Running totals, readable without stopping classification
#[derive(Debug, Default)]
pub struct ClassifierStats {
    proxied: AtomicU64,
    direct: AtomicU64,
    blocked: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of [`ClassifierStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub proxied: u64,
    pub direct: u64,
    pub blocked: u64,
    pub faults: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.proxied + self.direct + self.blocked
    }
}

impl ClassifierStats {
    fn record(&self, verdict: &Verdict) {
        let counter = match verdict.decision {
            Decision::Proxy(_) => &self.proxied,
            Decision::Direct => &self.direct,
            Decision::Block => &self.blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if verdict.fault().is_some() {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            proxied: self.proxied.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Hot-path entry point for the capture component
pub struct Classifier {
    table: Arc<RuleTable>,
    stats: ClassifierStats,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl Classifier {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self {
            table,
            stats: ClassifierStats::default(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn classify(&self, attempt: &ConnectionAttempt) -> Decision {
        self.classify_verdict(attempt).decision
    }

    /// Like [`Classifier::classify`] but keeps the match provenance
    pub fn classify_verdict(&self, attempt: &ConnectionAttempt) -> Verdict {
        let snapshot = self.table.load();
        let verdict = evaluate(&snapshot, attempt);

        if let Some(fault) = verdict.fault() {
            warn!(
                process = %attempt.process_name,
                dest = %attempt.dest_ip,
                port = attempt.dest_port,
                error = %fault,
                "Classification fault, falling back to DIRECT"
            );
        } else {
            trace!(
                process = %attempt.process_name,
                dest = %attempt.dest_ip,
                port = attempt.dest_port,
                decision = %verdict.decision,
                source = %verdict.source,
                "Classified"
            );
        }

        self.stats.record(&verdict);
        if let Some(observer) = &self.observer {
            // A panicking observer must not unwind into the capture driver
            let notified =
                panic::catch_unwind(AssertUnwindSafe(|| observer.on_classified(attempt, &verdict)));
            if notified.is_err() {
                self.stats.record_fault();
                error!(
                    process = %attempt.process_name,
                    dest = %attempt.dest_ip,
                    "Connection observer panicked"
                );
            }
        }
        verdict
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn table(&self) -> &Arc<RuleTable> {
        &self.table
    }
}

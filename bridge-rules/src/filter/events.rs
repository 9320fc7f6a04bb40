//! Observation of classification results
//!
//! Observers are called synchronously from the classification path, so
//! implementations must not block. [`ChannelObserver`] hands events to an
//! async consumer and drops them when the consumer falls behind.

use super::classifier::{ConnectionAttempt, Verdict};
use super::rule::{Action, RuleId, Transport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::info;

/// Receives every classification.
///
/// Called synchronously on the classification path; implementations must
/// not block. A panic is caught by the classifier and counted as a fault.
pub trait ConnectionObserver: Send + Sync {
    fn on_classified(&self, attempt: &ConnectionAttempt, verdict: &Verdict);
}

/// Owned record of one classification
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub process_name: String,
    pub process_id: u32,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub protocol: Transport,
    pub action: Action,
    pub rule: Option<RuleId>,
    /// Upstream endpoint for PROXY decisions
    pub proxy: Option<String>,
}

impl ConnectionEvent {
    pub fn new(attempt: &ConnectionAttempt, verdict: &Verdict) -> Self {
        Self {
            timestamp: Utc::now(),
            process_name: attempt.process_name.clone(),
            process_id: attempt.process_id,
            dest_ip: attempt.dest_ip,
            dest_port: attempt.dest_port,
            protocol: attempt.protocol,
            action: verdict.decision.action(),
            rule: verdict.rule_id(),
            proxy: verdict.decision.proxy().map(|proxy| proxy.endpoint()),
        }
    }
}

/// Forwards events into a bounded tokio channel
pub struct ChannelObserver {
    tx: mpsc::Sender<ConnectionEvent>,
    dropped: AtomicU64,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_classified(&self, attempt: &ConnectionAttempt, verdict: &Verdict) {
        if self.tx.try_send(ConnectionEvent::new(attempt, verdict)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Logs one line per classification
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_classified(&self, attempt: &ConnectionAttempt, verdict: &Verdict) {
        info!(
            target: "proxybridge::connections",
            process = %attempt.process_name,
            pid = attempt.process_id,
            dest = %attempt.dest_ip,
            port = attempt.dest_port,
            protocol = %attempt.protocol,
            decision = %verdict.decision,
            source = %verdict.source,
            "Connection classified"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::classifier::{Decision, MatchSource};

    fn attempt() -> ConnectionAttempt {
        ConnectionAttempt::new("curl", 42, IpAddr::from([8, 8, 8, 8]), 443, Transport::Tcp)
    }

    fn verdict() -> Verdict {
        Verdict {
            decision: Decision::Block,
            source: MatchSource::Rule(RuleId::new(3).unwrap()),
            adjustment: None,
        }
    }

    #[test]
    fn test_channel_observer_delivers_events() {
        let (observer, mut rx) = ChannelObserver::new(4);
        observer.on_classified(&attempt(), &verdict());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.process_name, "curl");
        assert_eq!(event.action, Action::Block);
        assert_eq!(event.rule.map(RuleId::get), Some(3));
        assert!(event.proxy.is_none());
    }

    #[test]
    fn test_channel_observer_counts_drops() {
        let (observer, _rx) = ChannelObserver::new(1);
        observer.on_classified(&attempt(), &verdict());
        observer.on_classified(&attempt(), &verdict());
        observer.on_classified(&attempt(), &verdict());
        assert_eq!(observer.dropped(), 2);
    }

    #[test]
    fn test_closed_channel_counts_drops() {
        let (observer, rx) = ChannelObserver::new(4);
        drop(rx);
        observer.on_classified(&attempt(), &verdict());
        assert_eq!(observer.dropped(), 1);
    }
}

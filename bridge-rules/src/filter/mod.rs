//! Rule storage and connection classification

pub mod classifier;
pub mod events;
pub mod guard;
pub mod matcher;
pub mod pattern;
pub mod rule;
pub mod snapshot;
pub mod table;

pub use classifier::{
    Adjustment, Classifier, ConnectionAttempt, Decision, MatchSource, StatsSnapshot, Verdict,
};
pub use events::{ChannelObserver, ConnectionEvent, ConnectionObserver, TracingObserver};
pub use guard::SelfExclusionGuard;
pub use matcher::{matches_host, matches_port, matches_process};
pub use rule::{Action, Protocol, Rule, RuleId, RuleSpec, Transport};
pub use snapshot::{Exclusion, RoutingOptions, Snapshot};
pub use table::RuleTable;

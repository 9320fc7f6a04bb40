//! Boundary to the component that intercepts connections
//!
//! A capture driver observes new connections at the OS level, asks the
//! [`Classifier`] for a decision, and then lets the connection through,
//! redirects it to the relay, or drops it. Drivers own their threads;
//! `classify` is safe to call from any number of them.

use crate::error::Result;
use bridge_rules::Classifier;
use std::sync::Arc;

pub trait CaptureDriver: Send {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Begin intercepting connections and route them through `classifier`
    fn start(&mut self, classifier: Arc<Classifier>) -> Result<()>;

    /// Stop intercepting; must be safe to call when not running
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

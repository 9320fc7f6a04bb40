//! Capture driver that replays recorded connection attempts
//!
//! Input is one attempt per line: `process pid ip port tcp|udp [hostname]`.
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{bail, Context};
use bridge_core::{BridgeError, CaptureDriver};
use bridge_rules::{Classifier, ConnectionAttempt, Transport};
use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Parse one replay line; `Ok(None)` for blank and comment lines
pub fn parse_line(line: &str) -> anyhow::Result<Option<ConnectionAttempt>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 || fields.len() > 6 {
        bail!("expected `process pid ip port tcp|udp [hostname]`, got {} fields", fields.len());
    }

    let pid = fields[1]
        .parse::<u32>()
        .with_context(|| format!("invalid pid {}", fields[1]))?;
    let ip = fields[2]
        .parse::<IpAddr>()
        .with_context(|| format!("invalid address {}", fields[2]))?;
    let port = fields[3]
        .parse::<u16>()
        .with_context(|| format!("invalid port {}", fields[3]))?;
    let transport = fields[4].parse::<Transport>().map_err(anyhow::Error::msg)?;

    let mut attempt = ConnectionAttempt::new(fields[0], pid, ip, port, transport);
    if let Some(host) = fields.get(5) {
        attempt = attempt.with_host(*host);
    }
    Ok(Some(attempt))
}

/// Totals reported when the input is exhausted
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub classified: u64,
    pub skipped: u64,
}

type Input = Box<dyn BufRead + Send>;
type Output = Box<dyn Write + Send>;

pub struct ReplayDriver {
    input: Option<(Input, Output)>,
    done: Option<mpsc::Sender<ReplaySummary>>,
    gate: Option<mpsc::Receiver<()>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Holds a started [`ReplayDriver`] back until released.
///
/// Dropping the gate without releasing it ends the replay unread.
pub struct ReplayGate(mpsc::Sender<()>);

impl ReplayGate {
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

impl ReplayDriver {
    /// Driver plus a receiver that yields the summary once input ends
    pub fn new(input: Input, output: Output) -> (Self, mpsc::Receiver<ReplaySummary>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                input: Some((input, output)),
                done: Some(tx),
                gate: None,
                stop: Arc::new(AtomicBool::new(false)),
                worker: None,
            },
            rx,
        )
    }

    /// Like [`ReplayDriver::new`], but classification waits for the gate.
    ///
    /// A session starts its driver before installing the session rules;
    /// releasing after `connect` returns keeps the output deterministic.
    pub fn gated(
        input: Input,
        output: Output,
    ) -> (Self, mpsc::Receiver<ReplaySummary>, ReplayGate) {
        let (mut driver, done) = Self::new(input, output);
        let (tx, rx) = mpsc::channel();
        driver.gate = Some(rx);
        (driver, done, ReplayGate(tx))
    }
}

fn replay(
    input: Input,
    mut output: Output,
    classifier: &Classifier,
    stop: &AtomicBool,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    for (index, line) in input.lines().enumerate() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Replay input failed");
                break;
            }
        };

        match parse_line(&line) {
            Ok(Some(attempt)) => {
                let verdict = classifier.classify_verdict(&attempt);
                summary.classified += 1;
                let written = writeln!(
                    output,
                    "{} -> {}:{}/{}: {} ({})",
                    attempt.process_name,
                    attempt.dest_ip,
                    attempt.dest_port,
                    attempt.protocol,
                    verdict.decision,
                    verdict.source
                );
                if written.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                summary.skipped += 1;
                warn!(line = index + 1, error = %e, "Skipping replay line");
            }
        }
    }

    let _ = output.flush();
    summary
}

impl CaptureDriver for ReplayDriver {
    fn name(&self) -> &str {
        "replay"
    }

    fn start(&mut self, classifier: Arc<Classifier>) -> bridge_core::Result<()> {
        let (input, output) = self
            .input
            .take()
            .ok_or_else(|| BridgeError::driver("replay", "input already consumed"))?;
        let done = self.done.take();
        let gate = self.gate.take();
        let stop = self.stop.clone();

        let worker = std::thread::Builder::new()
            .name("replay".to_string())
            .spawn(move || {
                if let Some(gate) = gate {
                    if gate.recv().is_err() {
                        debug!("Replay gate dropped before release");
                        return;
                    }
                }
                let summary = replay(input, output, &classifier, &stop);
                debug!(?summary, "Replay finished");
                if let Some(done) = done {
                    let _ = done.send(summary);
                }
            })
            .map_err(|e| BridgeError::driver("replay", e))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> bridge_core::Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            // A worker blocked on stdin is left to exit with the process
            if worker.is_finished() {
                worker
                    .join()
                    .map_err(|_| BridgeError::driver("replay", "worker panicked"))?;
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }
}

//! Command-line control surface for the proxy bridge

mod replay;

use anyhow::{Context, Result};
use bridge_core::{CaptureDriver, CommonArgs, ProxyBridge, SessionOptions};
use bridge_rules::config::ConfigValidator;
use bridge_rules::filter::{ConnectionObserver, TracingObserver};
use bridge_rules::{ConnectionAttempt, ProxyConfig, Transport};
use clap::{Parser, Subcommand};
use replay::ReplayDriver;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "proxybridge")]
#[command(about = "Per-process proxy routing rules: inspect, classify and test", version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and report shadowed rules
    Check,

    /// List rules in evaluation order
    Rules,

    /// Classify a single connection attempt
    Classify {
        /// Process name or path
        process: String,
        /// Destination IP address
        dest: IpAddr,
        /// Destination port
        port: u16,
        /// Classify as UDP instead of TCP
        #[arg(long)]
        udp: bool,
        /// Destination hostname, when known
        #[arg(long)]
        host: Option<String>,
        #[arg(long, default_value_t = 0)]
        pid: u32,
    },

    /// Classify recorded attempts (`process pid ip port tcp|udp [host]` per line)
    Replay {
        /// Input file (default: stdin)
        file: Option<PathBuf>,
        /// Run inside a full session: bypass rules plus a global PROXY rule
        #[arg(long)]
        session: bool,
        /// Log every classification
        #[arg(long)]
        events: bool,
    },

    /// Test the configured proxy end-to-end
    Test {
        #[arg(default_value = "google.com")]
        host: String,
        #[arg(default_value_t = 80)]
        port: u16,
    },

    /// Parse a proxy string and show the result
    ParseProxy { input: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = if args.common.verbose {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
    } else {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::ParseProxy { input } => parse_proxy(&input),
        Command::Check => check(&args.common),
        Command::Rules => list_rules(&args.common),
        Command::Classify {
            process,
            dest,
            port,
            udp,
            host,
            pid,
        } => {
            let transport = if udp { Transport::Udp } else { Transport::Tcp };
            let mut attempt = ConnectionAttempt::new(process, pid, dest, port, transport);
            if let Some(host) = host {
                attempt = attempt.with_host(host);
            }
            classify(&args.common, &attempt)
        }
        Command::Replay {
            file,
            session,
            events,
        } => run_replay(&args.common, file, session, events),
        Command::Test { host, port } => test_proxy(&args.common, &host, port).await,
    }
}

fn observer(events: bool) -> Option<Arc<dyn ConnectionObserver>> {
    events.then(|| Arc::new(TracingObserver) as Arc<dyn ConnectionObserver>)
}

fn load_bridge(common: &CommonArgs, events: bool) -> Result<ProxyBridge> {
    let config = common.load_config().context("Failed to load configuration")?;
    ProxyBridge::from_config_with_observer(&config, observer(events))
        .context("Failed to apply configuration")
}

fn parse_proxy(input: &str) -> Result<()> {
    let proxy = ProxyConfig::parse(input).context("Invalid proxy string")?;
    println!("kind:     {}", proxy.kind);
    println!("host:     {}", proxy.host);
    println!("port:     {}", proxy.port);
    println!("username: {}", proxy.username);
    println!(
        "password: {}",
        if proxy.password.is_empty() { "(none)" } else { "(set)" }
    );
    Ok(())
}

fn check(common: &CommonArgs) -> Result<()> {
    let config = common.load_config().context("Configuration is invalid")?;
    let warnings = ConfigValidator::lint(&config);
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    // Activation resolves the proxy host and admits the rules
    let bridge = ProxyBridge::from_config(&config).context("Configuration cannot be applied")?;

    match bridge.proxy_config() {
        Some(proxy) => println!("proxy: {}", proxy),
        None => println!("proxy: (none)"),
    }
    println!(
        "rules: {} ({} warning{})",
        config.rules.len(),
        warnings.len(),
        if warnings.len() == 1 { "" } else { "s" }
    );
    println!("OK");
    Ok(())
}

fn list_rules(common: &CommonArgs) -> Result<()> {
    let bridge = load_bridge(common, false)?;
    let snapshot = bridge.table().snapshot();

    if let Some(exclusion) = snapshot.exclusion() {
        println!("{}  [proxy exclusion for {}]", exclusion.rule, exclusion.proxy_host);
    }
    for rule in snapshot.rules() {
        println!("{}", rule);
    }
    println!("default -> {}", snapshot.options().default_action);
    Ok(())
}

fn classify(common: &CommonArgs, attempt: &ConnectionAttempt) -> Result<()> {
    let bridge = load_bridge(common, false)?;
    let verdict = bridge.classifier().classify_verdict(attempt);

    println!("{}", verdict.decision);
    println!("matched: {}", verdict.source);
    if let Some(adjustment) = &verdict.adjustment {
        println!("adjusted: {:?}", adjustment);
    }
    Ok(())
}

fn run_replay(common: &CommonArgs, file: Option<PathBuf>, session: bool, events: bool) -> Result<()> {
    let config = common.load_config().context("Failed to load configuration")?;

    let input: Box<dyn std::io::BufRead + Send> = match &file {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    if session {
        let proxy = config
            .proxy_config()?
            .context("--session needs a proxy (config [proxy] or --proxy)")?;

        // The session installs its own bypass and global rules
        let bridge = match observer(events) {
            Some(observer) => ProxyBridge::with_observer(config.options.routing(), observer),
            None => ProxyBridge::new(config.options.routing()),
        };
        let (driver, done, gate) = ReplayDriver::gated(input, Box::new(std::io::stdout()));
        bridge
            .connect(Box::new(driver), proxy, SessionOptions::from(&config.options))
            .context("Failed to start session")?;
        gate.release();

        let summary = done.recv().context("Replay ended unexpectedly")?;
        bridge.disconnect().context("Failed to stop session")?;
        report(&bridge, summary);
    } else {
        let bridge = ProxyBridge::from_config_with_observer(&config, observer(events))
            .context("Failed to apply configuration")?;
        let (mut driver, done) = ReplayDriver::new(input, Box::new(std::io::stdout()));
        driver
            .start(bridge.classifier())
            .context("Failed to start replay")?;
        let summary = done.recv().context("Replay ended unexpectedly")?;
        driver.stop().context("Failed to stop replay")?;
        report(&bridge, summary);
    }
    Ok(())
}

fn report(bridge: &ProxyBridge, summary: replay::ReplaySummary) {
    let stats = bridge.classifier().stats();
    eprintln!(
        "{} classified ({} proxy, {} direct, {} block, {} faults), {} skipped",
        summary.classified, stats.proxied, stats.direct, stats.blocked, stats.faults, summary.skipped
    );
}

async fn test_proxy(common: &CommonArgs, host: &str, port: u16) -> Result<()> {
    let bridge = load_bridge(common, false)?;
    if bridge.proxy_config().is_none() {
        anyhow::bail!("No proxy configured (config [proxy] or --proxy)");
    }

    let text = bridge.test_connection(host, port).await;
    println!("{}", text);
    if !text.contains("SUCCESS") {
        std::process::exit(1);
    }
    Ok(())
}

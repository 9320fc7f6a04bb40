//! Control surface over the rule table, the upstream proxy and a capture session

use crate::driver::CaptureDriver;
use crate::error::{BridgeError, Result};
use bridge_rules::config::{Config, ConfigLoader, OptionsSection};
use bridge_rules::filter::ConnectionObserver;
use bridge_rules::{
    Action, Classifier, ConnectionAttempt, Decision, ProxyConfig, RoutingOptions, Rule, RuleError,
    RuleId, RuleSpec, RuleTable, SelfExclusionGuard,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Flags applied when a session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub dns_via_proxy: bool,
    pub disable_udp: bool,
    /// Add the built-in local network DIRECT rules
    pub bypass_local: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&OptionsSection::default())
    }
}

impl From<&OptionsSection> for SessionOptions {
    fn from(options: &OptionsSection) -> Self {
        Self {
            dns_via_proxy: options.dns_via_proxy,
            disable_udp: options.disable_udp,
            bypass_local: options.bypass_local,
        }
    }
}

/// A running capture session and the rules it added
struct Session {
    driver: Box<dyn CaptureDriver>,
    rules: Vec<RuleId>,
    global_rule: RuleId,
    started_at: DateTime<Utc>,
}

/// Public state of the active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub driver: String,
    pub global_rule: RuleId,
    pub started_at: DateTime<Utc>,
}

pub struct ProxyBridge {
    table: Arc<RuleTable>,
    guard: SelfExclusionGuard,
    classifier: Arc<Classifier>,
    session: Mutex<Option<Session>>,
}

impl ProxyBridge {
    pub fn new(options: RoutingOptions) -> Self {
        Self::build(Arc::new(RuleTable::new(options)), None)
    }

    pub fn with_observer(options: RoutingOptions, observer: Arc<dyn ConnectionObserver>) -> Self {
        Self::build(Arc::new(RuleTable::new(options)), Some(observer))
    }

    fn build(table: Arc<RuleTable>, observer: Option<Arc<dyn ConnectionObserver>>) -> Self {
        let mut classifier = Classifier::new(table.clone());
        if let Some(observer) = observer {
            classifier = classifier.with_observer(observer);
        }
        Self {
            guard: SelfExclusionGuard::new(table.clone()),
            classifier: Arc::new(classifier),
            table,
            session: Mutex::new(None),
        }
    }

    /// Build from a loaded configuration: its rules plus its optional proxy.
    ///
    /// The proxy is activated before the rules are added so that a global
    /// PROXY rule in the file is admitted.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_observer(config, None)
    }

    pub fn from_config_with_observer(
        config: &Config,
        observer: Option<Arc<dyn ConnectionObserver>>,
    ) -> Result<Self> {
        let bridge = Self::build(
            Arc::new(RuleTable::new(config.options.routing())),
            observer,
        );
        if let Some(proxy) = config.proxy_config()? {
            bridge.set_proxy_config(proxy)?;
        }
        let ids = bridge.table.add_all(&config.rules)?;
        info!(rules = ids.len(), "Bridge configured");
        Ok(bridge)
    }

    pub fn classifier(&self) -> Arc<Classifier> {
        self.classifier.clone()
    }

    pub fn table(&self) -> &Arc<RuleTable> {
        &self.table
    }

    pub fn classify(&self, attempt: &ConnectionAttempt) -> Decision {
        self.classifier.classify(attempt)
    }

    pub fn add_rule(&self, spec: &RuleSpec) -> Result<RuleId> {
        Ok(self.table.add(spec)?)
    }

    pub fn edit_rule(&self, id: RuleId, spec: &RuleSpec) -> Result<()> {
        Ok(self.table.edit(id, spec)?)
    }

    pub fn delete_rule(&self, id: RuleId) -> Result<()> {
        Ok(self.table.delete(id)?)
    }

    pub fn enable_rule(&self, id: RuleId) -> Result<()> {
        Ok(self.table.enable(id)?)
    }

    pub fn disable_rule(&self, id: RuleId) -> Result<()> {
        Ok(self.table.disable(id)?)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.table.rules()
    }

    /// Replace the upstream; its exclusion rule is published with it
    pub fn set_proxy_config(&self, proxy: ProxyConfig) -> Result<RuleId> {
        Ok(self.guard.activate(proxy)?)
    }

    pub fn proxy_config(&self) -> Option<Arc<ProxyConfig>> {
        self.table.proxy()
    }

    /// Drop the upstream and its exclusion rule
    pub fn clear_proxy_config(&self) -> bool {
        self.guard.deactivate()
    }

    pub fn set_dns_via_proxy(&self, enabled: bool) {
        self.table.update_options(|options| options.dns_via_proxy = enabled);
    }

    pub fn set_disable_udp(&self, disabled: bool) {
        self.table.update_options(|options| options.disable_udp = disabled);
    }

    pub fn set_default_action(&self, action: Action) {
        self.table.update_options(|options| options.default_action = action);
    }

    pub fn options(&self) -> RoutingOptions {
        self.table.options()
    }

    /// Exercise the active upstream against `host:port`
    pub async fn test_connection(&self, host: &str, port: u16) -> String {
        match self.proxy_config() {
            Some(proxy) => bridge_probe::test_connection(&proxy, host, port).await,
            None => "ERROR: no proxy configured".to_string(),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session().as_ref().map(|session| SessionInfo {
            driver: session.driver.name().to_string(),
            global_rule: session.global_rule,
            started_at: session.started_at,
        })
    }

    /// Route all traffic through `proxy`.
    ///
    /// Steps: activate the upstream and flags, start the driver, add the
    /// local bypass rules, then the global PROXY rule. Any failure undoes
    /// the earlier steps.
    pub fn connect(
        &self,
        mut driver: Box<dyn CaptureDriver>,
        proxy: ProxyConfig,
        options: SessionOptions,
    ) -> Result<SessionInfo> {
        let mut session = self.session();
        if session.is_some() {
            return Err(BridgeError::AlreadyConnected);
        }

        info!(proxy = %proxy, driver = driver.name(), "Connecting");
        self.set_proxy_config(proxy)?;
        self.table.update_options(|current| {
            current.dns_via_proxy = options.dns_via_proxy;
            current.disable_udp = options.disable_udp;
        });

        if let Err(e) = driver.start(self.classifier.clone()) {
            error!(driver = driver.name(), error = %e, "Capture driver failed to start");
            self.guard.deactivate();
            return Err(e);
        }
        debug!(driver = driver.name(), "Capture driver started");

        let mut added = Vec::new();
        let global_rule = match self.add_session_rules(options.bypass_local, &mut added) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Session setup failed, rolling back");
                self.delete_session_rules(&added);
                if let Err(stop_err) = driver.stop() {
                    error!(driver = driver.name(), error = %stop_err, "Capture driver failed to stop");
                }
                self.guard.deactivate();
                return Err(e);
            }
        };

        let started = Session {
            driver,
            rules: added,
            global_rule,
            started_at: Utc::now(),
        };
        let info = SessionInfo {
            driver: started.driver.name().to_string(),
            global_rule,
            started_at: started.started_at,
        };
        *session = Some(started);

        info!(global_rule = %global_rule, "Connected");
        Ok(info)
    }

    fn add_session_rules(&self, bypass_local: bool, added: &mut Vec<RuleId>) -> Result<RuleId> {
        if bypass_local {
            for spec in ConfigLoader::builtin_rules()? {
                added.push(self.table.add(&spec)?);
            }
            debug!(rules = added.len(), "Local bypass rules added");
        }

        let global = self.table.add(&RuleSpec::global_proxy())?;
        added.push(global);
        Ok(global)
    }

    fn delete_session_rules(&self, ids: &[RuleId]) {
        for &id in ids {
            match self.table.delete(id) {
                Ok(()) => {}
                // Removed by the user while the session ran
                Err(RuleError::RuleNotFound { .. }) => debug!(rule = %id, "Session rule already gone"),
                Err(e) => warn!(rule = %id, error = %e, "Failed to delete session rule"),
            }
        }
    }

    /// Undo [`ProxyBridge::connect`]: delete the session rules, stop the
    /// driver and drop the upstream with its exclusion
    pub fn disconnect(&self) -> Result<()> {
        let mut session = self
            .session()
            .take()
            .ok_or(BridgeError::NotConnected)?;

        info!(driver = session.driver.name(), "Disconnecting");
        self.delete_session_rules(&session.rules);
        let stopped = session.driver.stop();
        self.guard.deactivate();

        if let Err(e) = &stopped {
            error!(driver = session.driver.name(), error = %e, "Capture driver failed to stop");
        } else {
            info!("Disconnected");
        }
        stopped
    }
}

impl Default for ProxyBridge {
    fn default() -> Self {
        Self::new(RoutingOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_rules::{Protocol, ProxyKind, Transport};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Driver that records its state and can be told to fail
    struct MockDriver {
        running: Arc<AtomicBool>,
        fail_start: bool,
    }

    impl MockDriver {
        fn new() -> (Box<Self>, Arc<AtomicBool>) {
            let running = Arc::new(AtomicBool::new(false));
            (
                Box::new(Self {
                    running: running.clone(),
                    fail_start: false,
                }),
                running,
            )
        }
    }

    impl CaptureDriver for MockDriver {
        fn name(&self) -> &str {
            "mock"
        }

        fn start(&mut self, _classifier: Arc<Classifier>) -> Result<()> {
            if self.fail_start {
                return Err(BridgeError::driver("mock", "access denied"));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn proxy() -> ProxyConfig {
        ProxyConfig::new(ProxyKind::Socks5, "1.2.3.4", 1080)
    }

    fn tcp(dest: &str, port: u16) -> ConnectionAttempt {
        ConnectionAttempt::new("app.exe", 1, dest.parse::<IpAddr>().unwrap(), port, Transport::Tcp)
    }

    #[test]
    fn test_connect_routes_traffic() {
        let bridge = ProxyBridge::default();
        let (driver, running) = MockDriver::new();

        let info = bridge.connect(driver, proxy(), SessionOptions::default()).unwrap();
        assert!(running.load(Ordering::SeqCst));
        assert!(bridge.is_connected());
        assert_eq!(info.driver, "mock");

        // Six local bypass rules plus the global rule, global last
        let rules = bridge.rules();
        assert_eq!(rules.len(), 7);
        assert_eq!(rules.last().unwrap().id, info.global_rule);

        assert_eq!(bridge.classify(&tcp("192.168.1.10", 80)), Decision::Direct);
        assert_eq!(bridge.classify(&tcp("1.2.3.4", 1080)), Decision::Direct);
        assert!(matches!(bridge.classify(&tcp("8.8.8.8", 443)), Decision::Proxy(_)));
    }

    #[test]
    fn test_disconnect_restores_state() {
        let bridge = ProxyBridge::default();
        let user_rule = bridge
            .add_rule(&RuleSpec::new("game.exe", "*", "*", Protocol::Udp, Action::Block))
            .unwrap();
        let (driver, running) = MockDriver::new();
        bridge.connect(driver, proxy(), SessionOptions::default()).unwrap();

        bridge.disconnect().unwrap();
        assert!(!running.load(Ordering::SeqCst));
        assert!(!bridge.is_connected());
        assert!(bridge.proxy_config().is_none());
        assert!(bridge.table().snapshot().exclusion().is_none());

        let ids: Vec<_> = bridge.rules().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![user_rule]);
        assert!(matches!(bridge.disconnect(), Err(BridgeError::NotConnected)));
    }

    #[test]
    fn test_connect_twice_is_refused() {
        let bridge = ProxyBridge::default();
        let (first, _) = MockDriver::new();
        let (second, _) = MockDriver::new();
        bridge.connect(first, proxy(), SessionOptions::default()).unwrap();
        assert!(matches!(
            bridge.connect(second, proxy(), SessionOptions::default()),
            Err(BridgeError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_driver_failure_rolls_back() {
        let bridge = ProxyBridge::default();
        let running = Arc::new(AtomicBool::new(false));
        let driver = Box::new(MockDriver {
            running: running.clone(),
            fail_start: true,
        });

        let err = bridge.connect(driver, proxy(), SessionOptions::default()).unwrap_err();
        assert!(matches!(err, BridgeError::Driver { .. }));
        assert!(!bridge.is_connected());
        assert!(bridge.proxy_config().is_none());
        assert!(bridge.rules().is_empty());
    }

    #[test]
    fn test_unresolvable_proxy_refuses_connect() {
        let bridge = ProxyBridge::default();
        let (driver, running) = MockDriver::new();
        let bad = ProxyConfig::new(ProxyKind::Socks5, "no-such-host.invalid", 1080);

        let err = bridge.connect(driver, bad, SessionOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Rules(RuleError::ExclusionInstallFailed { .. })
        ));
        assert!(!running.load(Ordering::SeqCst));
        assert!(bridge.rules().is_empty());
    }

    #[test]
    fn test_session_flags_are_applied() {
        let bridge = ProxyBridge::default();
        let (driver, _) = MockDriver::new();
        let options = SessionOptions {
            dns_via_proxy: true,
            disable_udp: false,
            bypass_local: false,
        };
        bridge.connect(driver, proxy(), options).unwrap();

        assert_eq!(bridge.rules().len(), 1);
        assert!(bridge.options().dns_via_proxy);
        assert!(!bridge.options().disable_udp);
        assert!(matches!(bridge.classify(&tcp("8.8.8.8", 53)), Decision::Proxy(_)));
    }

    #[test]
    fn test_flag_setters() {
        let bridge = ProxyBridge::default();
        bridge.set_dns_via_proxy(true);
        bridge.set_disable_udp(false);
        bridge.set_default_action(Action::Block);

        let options = bridge.options();
        assert!(options.dns_via_proxy);
        assert!(!options.disable_udp);
        assert_eq!(options.default_action, Action::Block);
        assert_eq!(bridge.classify(&tcp("8.8.8.8", 80)), Decision::Block);
    }

    #[test]
    fn test_from_config() {
        let config = ConfigLoader::merge_builtins(
            ConfigLoader::parse(
                r#"
[proxy]
url = "1.2.3.4:1080"

[[rules]]
action = "proxy"
"#,
            )
            .unwrap(),
        )
        .unwrap();

        let bridge = ProxyBridge::from_config(&config).unwrap();
        assert_eq!(bridge.rules().len(), 7);
        assert_eq!(bridge.proxy_config().unwrap().port, 1080);
        assert_eq!(bridge.classify(&tcp("10.0.0.5", 80)), Decision::Direct);
        assert!(matches!(bridge.classify(&tcp("8.8.8.8", 80)), Decision::Proxy(_)));
        assert_eq!(bridge.classify(&tcp("1.2.3.4", 1080)), Decision::Direct);
    }

    #[tokio::test]
    async fn test_connection_without_proxy() {
        let bridge = ProxyBridge::default();
        assert_eq!(
            bridge.test_connection("example.com", 80).await,
            "ERROR: no proxy configured"
        );
    }
}

//! Classification rules

use super::pattern::{HostPattern, PortPattern, ProcessPattern};
use crate::error::PatternError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU32;

/// Unique rule identifier, allocated in ascending order and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(NonZeroU32);

impl RuleId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    #[serde(alias = "tcp+udp")]
    Both,
}

impl Protocol {
    pub fn covers(self, transport: Transport) -> bool {
        matches!(
            (self, transport),
            (Protocol::Both, _) | (Protocol::Tcp, Transport::Tcp) | (Protocol::Udp, Transport::Udp)
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Both => write!(f, "BOTH"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" | "tcp+udp" => Ok(Protocol::Both),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Transport of an observed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// What to do with a matching connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Proxy,
    #[default]
    Direct,
    Block,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Proxy => write!(f, "PROXY"),
            Action::Direct => write!(f, "DIRECT"),
            Action::Block => write!(f, "BLOCK"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proxy" => Ok(Action::Proxy),
            "direct" => Ok(Action::Direct),
            "block" => Ok(Action::Block),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

fn default_wildcard() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

/// Textual rule definition as supplied by a control surface or config file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleSpec {
    #[serde(default = "default_wildcard")]
    pub process: String,
    #[serde(default = "default_wildcard")]
    pub hosts: String,
    #[serde(default = "default_wildcard")]
    pub ports: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub action: Action,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RuleSpec {
    pub fn new(
        process: impl Into<String>,
        hosts: impl Into<String>,
        ports: impl Into<String>,
        protocol: Protocol,
        action: Action,
    ) -> Self {
        Self {
            process: process.into(),
            hosts: hosts.into(),
            ports: ports.into(),
            protocol,
            action,
            enabled: true,
        }
    }

    /// The catch-all `*`/`*`/`*`/BOTH/PROXY rule
    pub fn global_proxy() -> Self {
        Self::new("*", "*", "*", Protocol::Both, Action::Proxy)
    }

    /// Parse the patterns without allocating an id
    pub fn check(&self) -> Result<(), PatternError> {
        ProcessPattern::parse(&self.process)?;
        HostPattern::parse(&self.hosts)?;
        PortPattern::parse(&self.ports)?;
        Ok(())
    }
}

/// A compiled rule as stored in the rule table
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub process: ProcessPattern,
    pub hosts: HostPattern,
    pub ports: PortPattern,
    pub protocol: Protocol,
    pub action: Action,
    pub enabled: bool,
}

impl Rule {
    pub fn compile(id: RuleId, spec: &RuleSpec) -> Result<Self, PatternError> {
        Ok(Self {
            id,
            process: ProcessPattern::parse(&spec.process)?,
            hosts: HostPattern::parse(&spec.hosts)?,
            ports: PortPattern::parse(&spec.ports)?,
            protocol: spec.protocol,
            action: spec.action,
            enabled: spec.enabled,
        })
    }

    /// DIRECT rule for every process, port and transport towards `addrs`
    pub fn exclusion(id: RuleId, addrs: &[IpAddr]) -> Self {
        Self {
            id,
            process: ProcessPattern::any(),
            hosts: HostPattern::exact(addrs),
            ports: PortPattern::any(),
            protocol: Protocol::Both,
            action: Action::Direct,
            enabled: true,
        }
    }

    /// A rule that would send every connection to the proxy
    pub fn is_global_proxy(&self) -> bool {
        self.action == Action::Proxy
            && self.process.is_any()
            && self.hosts.is_any()
            && self.ports.is_any()
    }

    /// `process` must already be normalized; `hostname` lowercase
    pub fn matches(
        &self,
        process: &str,
        ip: IpAddr,
        hostname: Option<&str>,
        port: u16,
        transport: Transport,
    ) -> bool {
        self.enabled
            && self.protocol.covers(transport)
            && self.ports.matches(port)
            && self.hosts.matches(ip, hostname)
            && self.process.matches(process)
    }

    pub fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            process: self.process.as_str().to_string(),
            hosts: self.hosts.as_str().to_string(),
            ports: self.ports.as_str().to_string(),
            protocol: self.protocol,
            action: self.action,
            enabled: self.enabled,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {} {} -> {}{}",
            self.id,
            self.process,
            self.hosts,
            self.ports,
            self.protocol,
            self.action,
            if self.enabled { "" } else { " (disabled)" }
        )
    }
}

//! Upstream proxy endpoint and credentials

use crate::error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    #[default]
    Socks5,
}

impl ProxyKind {
    /// Whether the relay can carry UDP through this kind of upstream
    pub fn supports_udp(self) -> bool {
        matches!(self, ProxyKind::Socks5)
    }

    pub fn scheme(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Http => write!(f, "HTTP"),
            ProxyKind::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

impl std::str::FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyKind::Http),
            "socks5" | "socks" => Ok(ProxyKind::Socks5),
            other => Err(format!("unknown proxy kind: {other}")),
        }
    }
}

/// Active upstream proxy
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(RuleError::InvalidProxy("proxy host is empty".to_string()));
        }
        if host.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(RuleError::InvalidProxy(format!("invalid proxy host: {host}")));
        }
        if self.port == 0 {
            return Err(RuleError::InvalidProxy("proxy port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Addresses the upstream is reached at.
    ///
    /// An IP literal is returned as is; a hostname is resolved, which may
    /// block and must stay off the classification path.
    pub fn resolve_addrs(&self) -> Result<Vec<IpAddr>> {
        let host = self.host.trim();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let resolved = (host, self.port).to_socket_addrs().map_err(|e| {
            RuleError::ExclusionInstallFailed {
                host: host.to_string(),
                reason: format!("cannot resolve proxy host: {e}"),
            }
        })?;

        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }

        if addrs.is_empty() {
            return Err(RuleError::ExclusionInstallFailed {
                host: host.to_string(),
                reason: "proxy host resolved to no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.kind.scheme())?;
        if !self.username.is_empty() {
            write!(f, "{}@", self.username)?;
        }
        f.write_str(&self.endpoint())
    }
}

//! Typed rule patterns
//!
//! Rule text is parsed once, when a rule is added or edited. Matching
//! works on the parsed form and never touches the original string.

use crate::error::PatternError;
use ipnet::IpNet;
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use wildmatch::WildMatch;

/// Separators accepted between alternatives in process and host patterns
const LIST_SEPARATORS: &[char] = &[',', ';'];

/// Reduce a process path or name to the lowercase executable base name
pub fn normalize_process_name(name: &str) -> Cow<'_, str> {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name)
        .trim();

    if base.chars().any(char::is_uppercase) {
        Cow::Owned(base.to_lowercase())
    } else {
        Cow::Borrowed(base)
    }
}

#[derive(Debug, Clone)]
enum ProcessTerm {
    Exact(String),
    Wildcard(WildMatch),
}

/// Pattern over the originating executable name (case-insensitive)
#[derive(Debug, Clone)]
pub struct ProcessPattern {
    source: String,
    any: bool,
    terms: Vec<ProcessTerm>,
}

impl ProcessPattern {
    /// Pattern matching every process
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            any: true,
            terms: Vec::new(),
        }
    }

    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let source = pattern.trim();
        if source.is_empty() {
            return Err(PatternError::Empty { field: "process" });
        }

        let mut any = false;
        let mut terms = Vec::new();

        for token in source.split(LIST_SEPARATORS) {
            let token = token.trim();
            if token.is_empty()
                || token.contains(|c: char| c == '/' || c == '\\' || c.is_control())
            {
                return Err(PatternError::InvalidProcess {
                    pattern: source.to_string(),
                });
            }

            if token == "*" {
                any = true;
                continue;
            }

            let lower = token.to_lowercase();
            if lower.contains(|c| c == '*' || c == '?') {
                terms.push(ProcessTerm::Wildcard(WildMatch::new(&lower)));
            } else {
                terms.push(ProcessTerm::Exact(lower));
            }
        }

        Ok(Self {
            source: source.to_string(),
            any,
            terms,
        })
    }

    /// True when the pattern matches every process
    pub fn is_any(&self) -> bool {
        self.any
    }

    /// Match an already-normalized name (see [`normalize_process_name`])
    pub fn matches(&self, name: &str) -> bool {
        self.any
            || self.terms.iter().any(|term| match term {
                ProcessTerm::Exact(exact) => exact == name,
                ProcessTerm::Wildcard(wild) => wild.matches(name),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for ProcessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Dotted IPv4 pattern where `None` is a `*` octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OctetPattern([Option<u8>; 4]);

impl OctetPattern {
    fn parse(text: &str) -> Option<Self> {
        let mut octets = [None; 4];
        let mut parts = text.split('.');

        for slot in octets.iter_mut() {
            let part = parts.next()?;
            *slot = if part == "*" {
                None
            } else {
                if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some(part.parse::<u8>().ok()?)
            };
        }

        if parts.next().is_some() {
            return None;
        }

        Some(Self(octets))
    }

    fn has_wildcard(&self) -> bool {
        self.0.iter().any(Option::is_none)
    }

    fn matches(&self, ip: Ipv4Addr) -> bool {
        self.0
            .iter()
            .zip(ip.octets())
            .all(|(pattern, octet)| pattern.map_or(true, |value| value == octet))
    }

    fn lower_bound(&self) -> [u8; 4] {
        self.0.map(|octet| octet.unwrap_or(0))
    }

    fn upper_bound(&self) -> [u8; 4] {
        self.0.map(|octet| octet.unwrap_or(u8::MAX))
    }
}

/// Only digits, dots and `*`: text that must parse as an IPv4 form
fn is_numeric_like(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b'*')
}

fn is_hostname_like(text: &str) -> bool {
    !text.is_empty()
        && !text.starts_with('.')
        && !text.ends_with('.')
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'*'))
}

#[derive(Debug, Clone)]
enum HostTerm {
    Any,
    Range { low: [u8; 4], high: [u8; 4] },
    Exact(IpAddr),
    Octets(OctetPattern),
    Cidr(IpNet),
    Hostname(String),
    HostnameWildcard(WildMatch),
}

impl HostTerm {
    fn parse(token: &str) -> Option<Self> {
        if token == "*" {
            return Some(HostTerm::Any);
        }

        if let Ok(ip) = token.parse::<IpAddr>() {
            return Some(HostTerm::Exact(ip));
        }

        if token.contains('/') {
            return token.parse::<IpNet>().ok().map(HostTerm::Cidr);
        }

        if let Some((low, high)) = token.split_once('-') {
            if is_numeric_like(low) && is_numeric_like(high) {
                let low = OctetPattern::parse(low)?.lower_bound();
                let high = OctetPattern::parse(high)?.upper_bound();
                if low.iter().zip(high.iter()).any(|(l, h)| l > h) {
                    return None;
                }
                return Some(HostTerm::Range { low, high });
            }
        }

        if is_numeric_like(token) {
            // Wildcard-free dotted quads were handled by the IpAddr parse above
            return OctetPattern::parse(token)
                .filter(OctetPattern::has_wildcard)
                .map(HostTerm::Octets);
        }

        let lower = token.to_ascii_lowercase();
        if !is_hostname_like(&lower) {
            return None;
        }
        if lower.contains('*') {
            Some(HostTerm::HostnameWildcard(WildMatch::new(&lower)))
        } else {
            Some(HostTerm::Hostname(lower))
        }
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        match self {
            HostTerm::Any => true,
            HostTerm::Exact(exact) => *exact == ip,
            HostTerm::Cidr(net) => net.contains(&ip),
            HostTerm::Range { low, high } => match ip {
                IpAddr::V4(v4) => v4
                    .octets()
                    .iter()
                    .zip(low.iter().zip(high.iter()))
                    .all(|(octet, (l, h))| l <= octet && octet <= h),
                IpAddr::V6(_) => false,
            },
            HostTerm::Octets(pattern) => match ip {
                IpAddr::V4(v4) => pattern.matches(v4),
                IpAddr::V6(_) => false,
            },
            HostTerm::Hostname(_) | HostTerm::HostnameWildcard(_) => false,
        }
    }

    fn matches_name(&self, host: &str) -> bool {
        match self {
            HostTerm::Any => true,
            HostTerm::Hostname(name) => name == host,
            HostTerm::HostnameWildcard(wild) => wild.matches(host),
            _ => false,
        }
    }
}

/// Pattern over the destination host
#[derive(Debug, Clone)]
pub struct HostPattern {
    source: String,
    terms: Vec<HostTerm>,
}

impl HostPattern {
    /// Pattern matching every destination
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            terms: vec![HostTerm::Any],
        }
    }

    /// Exact match on any of the given addresses
    pub fn exact(addrs: &[IpAddr]) -> Self {
        let source = addrs
            .iter()
            .map(IpAddr::to_string)
            .collect::<Vec<_>>()
            .join(";");
        Self {
            source,
            terms: addrs.iter().copied().map(HostTerm::Exact).collect(),
        }
    }

    /// Strict parse: any malformed alternative rejects the whole pattern
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let source = pattern.trim();
        if source.is_empty() {
            return Err(PatternError::Empty { field: "host" });
        }

        let terms = source
            .split(LIST_SEPARATORS)
            .map(|token| {
                HostTerm::parse(token.trim()).ok_or_else(|| PatternError::InvalidHost {
                    pattern: token.trim().to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: source.to_string(),
            terms,
        })
    }

    /// Lenient parse: malformed alternatives are dropped and never match
    pub fn parse_lenient(pattern: &str) -> Self {
        let source = pattern.trim();
        Self {
            source: source.to_string(),
            terms: source
                .split(LIST_SEPARATORS)
                .filter_map(|token| HostTerm::parse(token.trim()))
                .collect(),
        }
    }

    /// True when the pattern matches every destination
    pub fn is_any(&self) -> bool {
        self.terms.iter().any(|term| matches!(term, HostTerm::Any))
    }

    /// Match a destination address and, when known, its lowercase hostname
    pub fn matches(&self, ip: IpAddr, hostname: Option<&str>) -> bool {
        self.terms.iter().any(|term| {
            term.matches_ip(ip) || hostname.is_some_and(|name| term.matches_name(name))
        })
    }

    /// Match a textual destination: an IP literal or a hostname
    pub fn matches_str(&self, ip_or_host: &str) -> bool {
        let candidate = ip_or_host.trim();
        match candidate.parse::<IpAddr>() {
            Ok(ip) => self.matches(ip, None),
            Err(_) => {
                let lower = candidate.to_ascii_lowercase();
                self.terms.iter().any(|term| term.matches_name(&lower))
            }
        }
    }

    /// True when every alternative is an exact address in `addrs`
    pub fn is_exact_for(&self, addrs: &[IpAddr]) -> bool {
        !self.terms.is_empty()
            && addrs.iter().all(|addr| {
                self.terms
                    .iter()
                    .any(|term| matches!(term, HostTerm::Exact(exact) if exact == addr))
            })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortTerm {
    Any,
    Single(u16),
    Range(u16, u16),
}

impl PortTerm {
    fn parse(token: &str) -> Option<Self> {
        if token == "*" {
            return Some(PortTerm::Any);
        }

        if let Some((low, high)) = token.split_once('-') {
            let low = low.trim().parse::<u16>().ok()?;
            let high = high.trim().parse::<u16>().ok()?;
            return (low <= high).then_some(PortTerm::Range(low, high));
        }

        token.parse::<u16>().ok().map(PortTerm::Single)
    }

    fn matches(&self, port: u16) -> bool {
        match *self {
            PortTerm::Any => true,
            PortTerm::Single(single) => single == port,
            PortTerm::Range(low, high) => (low..=high).contains(&port),
        }
    }
}

/// Pattern over the destination port: `*`, single ports and inclusive ranges
#[derive(Debug, Clone)]
pub struct PortPattern {
    source: String,
    terms: Vec<PortTerm>,
}

impl PortPattern {
    /// Pattern matching every port
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            terms: vec![PortTerm::Any],
        }
    }

    /// Strict parse: any malformed token rejects the whole pattern
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let source = pattern.trim();
        if source.is_empty() {
            return Err(PatternError::Empty { field: "port" });
        }

        let terms = source
            .split(',')
            .map(|token| {
                PortTerm::parse(token.trim()).ok_or_else(|| PatternError::InvalidPort {
                    pattern: token.trim().to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: source.to_string(),
            terms,
        })
    }

    /// Lenient parse: malformed tokens are ignored and never match
    pub fn parse_lenient(pattern: &str) -> Self {
        let source = pattern.trim();
        Self {
            source: source.to_string(),
            terms: source
                .split(',')
                .filter_map(|token| PortTerm::parse(token.trim()))
                .collect(),
        }
    }

    pub fn is_any(&self) -> bool {
        self.terms.contains(&PortTerm::Any)
    }

    pub fn matches(&self, port: u16) -> bool {
        self.terms.iter().any(|term| term.matches(port))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for PortPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_dashed_range() {
        let pattern = HostPattern::parse("172.16.*.*-172.31.*.*").unwrap();
        assert!(pattern.matches(ip("172.20.5.9"), None));
        assert!(pattern.matches(ip("172.16.0.0"), None));
        assert!(pattern.matches(ip("172.31.255.255"), None));
        assert!(!pattern.matches(ip("172.32.0.1"), None));
        assert!(!pattern.matches(ip("172.15.255.255"), None));
        assert!(!pattern.matches(ip("::1"), None));
    }

    #[test]
    fn test_dashed_range_is_octet_wise() {
        let pattern = HostPattern::parse("10.0.0.10-10.0.0.20").unwrap();
        assert!(pattern.matches(ip("10.0.0.15"), None));
        assert!(!pattern.matches(ip("10.0.0.21"), None));

        // Reversed bounds on an octet can never match and are rejected
        assert!(HostPattern::parse("10.0.0.20-10.0.0.10").is_err());
    }

    #[test]
    fn test_octet_wildcard() {
        let pattern = HostPattern::parse("192.168.*.*").unwrap();
        assert!(pattern.matches(ip("192.168.1.1"), None));
        assert!(!pattern.matches(ip("192.169.1.1"), None));

        let middle = HostPattern::parse("10.*.0.1").unwrap();
        assert!(middle.matches(ip("10.200.0.1"), None));
        assert!(!middle.matches(ip("10.200.0.2"), None));
    }

    #[test]
    fn test_exact_and_any() {
        let exact = HostPattern::parse("1.2.3.4").unwrap();
        assert!(exact.matches(ip("1.2.3.4"), None));
        assert!(!exact.matches(ip("1.2.3.5"), None));

        let any = HostPattern::parse("*").unwrap();
        assert!(any.is_any());
        assert!(any.matches(ip("8.8.8.8"), None));
        assert!(any.matches(ip("2001:db8::1"), None));
    }

    #[test]
    fn test_cidr_and_ipv6() {
        let pattern = HostPattern::parse("10.0.0.0/8; fd00::/8").unwrap();
        assert!(pattern.matches(ip("10.9.8.7"), None));
        assert!(pattern.matches(ip("fd12::1"), None));
        assert!(!pattern.matches(ip("11.0.0.1"), None));
    }

    #[test]
    fn test_hostname_patterns() {
        let pattern = HostPattern::parse("*.Example.com, api.test.org").unwrap();
        assert!(pattern.matches_str("www.example.com"));
        assert!(pattern.matches_str("API.test.org"));
        assert!(!pattern.matches_str("example.org"));

        // Hostname alternatives match the resolved name, not the address
        assert!(pattern.matches(ip("1.1.1.1"), Some("cdn.example.com")));
        assert!(!pattern.matches(ip("1.1.1.1"), None));
    }

    #[test]
    fn test_invalid_host_patterns() {
        for bad in ["", "300.1.1.1", "10.*.*", "1.2.3.4.5", "10.0.0.0/40", "bad host", "ex!ample.com"] {
            assert!(HostPattern::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_lenient_host_fails_closed() {
        let pattern = HostPattern::parse_lenient("300.1.1.1");
        assert!(!pattern.matches_str("300.1.1.1"));
        assert!(!pattern.matches_str("44.1.1.1"));
    }

    #[test]
    fn test_port_list_and_ranges() {
        let pattern = PortPattern::parse("80,443,8000-8100").unwrap();
        assert!(pattern.matches(80));
        assert!(pattern.matches(443));
        assert!(pattern.matches(8050));
        assert!(!pattern.matches(8101));
        assert!(!pattern.matches(22));
    }

    #[test]
    fn test_port_strict_rejects_malformed() {
        assert!(PortPattern::parse("80,abc").is_err());
        assert!(PortPattern::parse("90-80").is_err());
        assert!(PortPattern::parse("70000").is_err());
        assert!(PortPattern::parse("").is_err());
    }

    #[test]
    fn test_port_lenient_ignores_malformed() {
        let pattern = PortPattern::parse_lenient("abc, 443, 90-80");
        assert!(pattern.matches(443));
        assert!(!pattern.matches(85));

        let any = PortPattern::parse_lenient("junk,*");
        assert!(any.matches(1));
    }

    #[test]
    fn test_process_patterns() {
        let pattern = ProcessPattern::parse("Chrome.exe; fire*.exe").unwrap();
        assert!(pattern.matches("chrome.exe"));
        assert!(pattern.matches("firefox.exe"));
        assert!(!pattern.matches("curl.exe"));

        assert!(ProcessPattern::parse("*").unwrap().is_any());
        assert!(ProcessPattern::parse("C:\\bin\\app.exe").is_err());
        assert!(ProcessPattern::parse(" ").is_err());
    }

    #[test]
    fn test_normalize_process_name() {
        assert_eq!(normalize_process_name("C:\\Program Files\\App\\App.EXE"), "app.exe");
        assert_eq!(normalize_process_name("/usr/bin/curl"), "curl");
        assert!(matches!(normalize_process_name("curl"), Cow::Borrowed(_)));
    }
}

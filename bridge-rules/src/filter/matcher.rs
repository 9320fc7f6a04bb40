//! One-shot matching on raw pattern strings
//!
//! These helpers parse the pattern on every call and never fail: a pattern
//! that cannot be parsed simply does not match. Rules stored in the table
//! are compiled once instead, see [`crate::filter::rule::Rule`].

use super::pattern::{normalize_process_name, HostPattern, PortPattern, ProcessPattern};

/// Match a process name or path against a process pattern
pub fn matches_process(pattern: &str, name: &str) -> bool {
    match ProcessPattern::parse(pattern) {
        Ok(compiled) => compiled.matches(&normalize_process_name(name)),
        Err(_) => false,
    }
}

/// Match an IP literal or hostname against a host pattern
pub fn matches_host(pattern: &str, ip_or_host: &str) -> bool {
    HostPattern::parse_lenient(pattern).matches_str(ip_or_host)
}

/// Match a port against a port pattern; malformed tokens are skipped
pub fn matches_port(pattern: &str, port: u16) -> bool {
    PortPattern::parse_lenient(pattern).matches(port)
}

//! Configuration validation and linting

use super::schema::Config;
use crate::error::{Result, RuleError};
use crate::filter::pattern::{HostPattern, PortPattern, ProcessPattern};
use crate::filter::rule::{Protocol, RuleSpec};

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the whole configuration
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_rules(&config.rules)?;
        config.proxy_config()?;
        Ok(())
    }

    /// Every rule must compile
    fn validate_rules(rules: &[RuleSpec]) -> Result<()> {
        for (index, rule) in rules.iter().enumerate() {
            rule.check().map_err(|source| RuleError::InvalidRulePattern {
                index: index + 1,
                source,
            })?;
        }
        Ok(())
    }

    /// Non-fatal findings: rules that can never match
    pub fn lint(config: &Config) -> Vec<String> {
        let mut warnings = Vec::new();

        // Earliest enabled catch-all covering each transport
        let mut tcp: Option<usize> = None;
        let mut udp: Option<usize> = None;
        for (index, rule) in config.rules.iter().enumerate() {
            let shadowed_by = match rule.protocol {
                Protocol::Tcp => tcp.map(|t| (t, t)),
                Protocol::Udp => udp.map(|u| (u, u)),
                Protocol::Both => tcp.zip(udp),
            };
            if let Some((first, second)) = shadowed_by {
                let by = if first == second {
                    format!("catch-all rule {}", first + 1)
                } else {
                    let (a, b) = (first.min(second), first.max(second));
                    format!("catch-all rules {} and {}", a + 1, b + 1)
                };
                warnings.push(format!("rule {} is shadowed by {}", index + 1, by));
                continue;
            }

            if rule.enabled && is_catch_all(rule) {
                if rule.protocol != Protocol::Udp {
                    tcp.get_or_insert(index);
                }
                if rule.protocol != Protocol::Tcp {
                    udp.get_or_insert(index);
                }
            }
        }

        warnings
    }
}

fn is_catch_all(rule: &RuleSpec) -> bool {
    let process = ProcessPattern::parse(&rule.process).map(|p| p.is_any());
    let hosts = HostPattern::parse(&rule.hosts).map(|p| p.is_any());
    let ports = PortPattern::parse(&rule.ports).map(|p| p.is_any());
    matches!((process, hosts, ports), (Ok(true), Ok(true), Ok(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxySection;
    use crate::filter::rule::Action;

    fn rule(hosts: &str, protocol: Protocol, action: Action) -> RuleSpec {
        RuleSpec::new("*", hosts, "*", protocol, action)
    }

    #[test]
    fn test_valid_config() {
        let config = Config {
            rules: vec![
                rule("10.*.*.*", Protocol::Both, Action::Direct),
                RuleSpec::global_proxy(),
            ],
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_ok());
        assert!(ConfigValidator::lint(&config).is_empty());
    }

    #[test]
    fn test_invalid_rule_names_index() {
        let config = Config {
            rules: vec![
                rule("10.*.*.*", Protocol::Both, Action::Direct),
                rule("10.*.*.*", Protocol::Both, Action::Direct),
                rule("999.1.1.1", Protocol::Both, Action::Direct),
            ],
            ..Config::default()
        };
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("rule 3"), "{}", err);
        match err {
            RuleError::InvalidRulePattern { index, source } => {
                assert_eq!(index, 3);
                assert!(matches!(source, crate::error::PatternError::InvalidHost { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_proxy_section() {
        let config = Config {
            proxy: Some(ProxySection {
                url: Some("ftp://1.2.3.4:21".to_string()),
                ..ProxySection::default()
            }),
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_lint_shadowed_rules() {
        let config = Config {
            rules: vec![
                RuleSpec::global_proxy(),
                rule("10.*.*.*", Protocol::Both, Action::Direct),
            ],
            ..Config::default()
        };
        let warnings = ConfigValidator::lint(&config);
        assert_eq!(warnings, vec!["rule 2 is shadowed by catch-all rule 1".to_string()]);
    }

    #[test]
    fn test_lint_respects_protocol_and_enabled() {
        let mut disabled = RuleSpec::global_proxy();
        disabled.enabled = false;

        let config = Config {
            rules: vec![
                disabled,
                rule("*", Protocol::Tcp, Action::Block),
                rule("1.1.1.1", Protocol::Udp, Action::Direct),
            ],
            ..Config::default()
        };
        assert!(ConfigValidator::lint(&config).is_empty());
    }

    #[test]
    fn test_lint_tracks_transports_separately() {
        let config = Config {
            rules: vec![
                rule("*", Protocol::Tcp, Action::Block),
                rule("*", Protocol::Udp, Action::Direct),
                rule("10.*.*.*", Protocol::Tcp, Action::Direct),
                rule("10.*.*.*", Protocol::Both, Action::Direct),
            ],
            ..Config::default()
        };
        assert_eq!(
            ConfigValidator::lint(&config),
            vec![
                "rule 3 is shadowed by catch-all rule 1".to_string(),
                "rule 4 is shadowed by catch-all rules 1 and 2".to_string(),
            ]
        );
    }
}

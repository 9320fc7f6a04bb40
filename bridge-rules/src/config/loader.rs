//! Configuration file loading and merging

use super::schema::Config;
use crate::error::{Result, RuleError};
use crate::filter::rule::RuleSpec;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const BUILTIN_TOML: &str = include_str!("../builtin-rules.toml");

#[derive(Deserialize)]
struct BuiltinRules {
    rules: Vec<RuleSpec>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        // Priority order:
        // 1. $PROXYBRIDGE_CONFIG
        // 2. $XDG_CONFIG_HOME/proxybridge/config.toml
        // 3. ~/.config/proxybridge/config.toml

        if let Ok(path) = env::var("PROXYBRIDGE_CONFIG") {
            return PathBuf::from(path);
        }

        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("proxybridge/config.toml");
        }

        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(".config/proxybridge/config.toml");
        }

        PathBuf::from("config.toml")
    }

    /// Load config from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| RuleError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Config> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Local network bypass rules embedded in the binary
    pub fn builtin_rules() -> Result<Vec<RuleSpec>> {
        let builtin: BuiltinRules = toml::from_str(BUILTIN_TOML)?;
        Ok(builtin.rules)
    }

    /// Prepend the built-in bypass rules when the config asks for them
    pub fn merge_builtins(mut config: Config) -> Result<Config> {
        if config.options.bypass_local {
            let mut rules = Self::builtin_rules()?;
            rules.append(&mut config.rules);
            config.rules = rules;
        }
        Ok(config)
    }

    /// Load the default config file, falling back to an empty config
    pub fn load() -> Result<Config> {
        let path = Self::default_config_path();

        if path.exists() {
            Self::load_from_file(&path)
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Load config from optional path or default, then merge built-ins
    /// Priority: Explicit path > User config > Defaults
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config> {
        let config = match path {
            Some(p) => Self::load_from_file(&p)?,
            None => Self::load()?,
        };
        Self::merge_builtins(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::rule::{Action, Protocol};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_rules_compile() {
        let rules = ConfigLoader::builtin_rules().unwrap();
        assert_eq!(rules.len(), 6);
        for rule in &rules {
            assert!(rule.check().is_ok(), "{:?}", rule);
            assert_eq!(rule.process, "*");
            assert_eq!(rule.ports, "*");
            assert_eq!(rule.protocol, Protocol::Both);
            assert_eq!(rule.action, Action::Direct);
        }
        assert!(rules.iter().any(|r| r.hosts == "172.16.*.*-172.31.*.*"));
    }

    #[test]
    fn test_load_from_file_merges_builtins_first() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[rules]]
action = "proxy"
"#
        )
        .unwrap();

        let config = ConfigLoader::load_or_default(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.rules.len(), 7);
        assert_eq!(config.rules[0].hosts, "127.*.*.*");
        assert_eq!(config.rules.last().unwrap().action, Action::Proxy);
    }

    #[test]
    fn test_bypass_local_disabled() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[options]
bypass_local = false

[[rules]]
hosts = "1.1.1.1"
action = "block"
"#
        )
        .unwrap();

        let config = ConfigLoader::load_or_default(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].action, Action::Block);
    }

    #[test]
    fn test_missing_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::load_from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, RuleError::ConfigLoad { .. }));
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let err = ConfigLoader::parse("[[rules]]\naction = 42\n").unwrap_err();
        assert!(matches!(err, RuleError::ConfigParse(_)));
    }
}

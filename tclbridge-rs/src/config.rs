//! Session configuration.
//!
//! | Setting | Env var | Default |
//! |---------|---------|---------|
//! | `diagnostics` | `TCLBRIDGE_DIAGNOSTICS` (`1`/`true`/`yes`/`on`) | off |
//! | `recursion_limit` | `TCLBRIDGE_RECURSION_LIMIT` | 1000 |
//! | `globals` | none | empty |

use thiserror::Error;

use crate::engine::interp::DEFAULT_RECURSION_LIMIT;
use crate::engine::obj::parse_boolean;

pub const DIAGNOSTICS_VAR: &str = "TCLBRIDGE_DIAGNOSTICS";
pub const RECURSION_LIMIT_VAR: &str = "TCLBRIDGE_RECURSION_LIMIT";

/// A malformed environment setting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{var}: invalid value \"{value}\"")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Log every captured script error through `tracing::warn!`.
    pub diagnostics: bool,
    /// Maximum nesting of evaluations before a script error is raised.
    pub recursion_limit: usize,
    /// Global variables set when the session is created, in order.
    pub globals: Vec<(String, String)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            diagnostics: false,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            globals: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(mut self, on: bool) -> Self {
        self.diagnostics = on;
        self
    }

    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit.max(1);
        self
    }

    pub fn global(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.globals.push((name.into(), value.into()));
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(DIAGNOSTICS_VAR) {
            config.diagnostics = parse_boolean(&value).ok_or(ConfigError {
                var: DIAGNOSTICS_VAR,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(RECURSION_LIMIT_VAR) {
            let limit = value.trim().parse::<usize>().ok().filter(|&n| n > 0);
            config.recursion_limit = limit.ok_or(ConfigError {
                var: RECURSION_LIMIT_VAR,
                value: value.clone(),
            })?;
        }
        Ok(config)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults() {
        let c = SessionConfig::default();
        assert!(!c.diagnostics);
        assert_eq!(c.recursion_limit, 1000);
        assert!(c.globals.is_empty());
    }

    #[test]
    fn builder_setters() {
        let c = SessionConfig::new()
            .diagnostics(true)
            .recursion_limit(0)
            .global("a", "1")
            .global("b", "2");
        assert!(c.diagnostics);
        assert_eq!(c.recursion_limit, 1);
        assert_eq!(c.globals, [("a".into(), "1".into()), ("b".into(), "2".into())]);
    }

    #[test]
    fn env_overrides() {
        let c = SessionConfig::from_lookup(lookup(&[
            (DIAGNOSTICS_VAR, "yes"),
            (RECURSION_LIMIT_VAR, " 50 "),
        ]))
        .unwrap();
        assert!(c.diagnostics);
        assert_eq!(c.recursion_limit, 50);
    }

    #[test]
    fn env_missing_keeps_defaults() {
        let c = SessionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c, SessionConfig::default());
    }

    #[test]
    fn env_bad_values() {
        let err = SessionConfig::from_lookup(lookup(&[(RECURSION_LIMIT_VAR, "lots")])).unwrap_err();
        assert_eq!(err.to_string(), "TCLBRIDGE_RECURSION_LIMIT: invalid value \"lots\"");
        assert!(SessionConfig::from_lookup(lookup(&[(RECURSION_LIMIT_VAR, "0")])).is_err());
        assert!(SessionConfig::from_lookup(lookup(&[(DIAGNOSTICS_VAR, "maybe")])).is_err());
    }
}

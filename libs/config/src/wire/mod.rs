//! on-disk configuration format
//!
//! Every field is optional on disk; missing values fall back to the defaults
//! below. The file may be JSON or YAML.
use std::num::NonZeroU64;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// default coordination store endpoints
pub const DEFAULT_ENDPOINTS: &[&str] = &["localhost:23791", "localhost:23792", "localhost:23793"];
/// default log filter
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: NonZeroU64,
    /// per-request deadline applied to every store RPC
    #[serde(default)]
    pub request_timeout_ms: Option<NonZeroU64>,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: NonZeroU64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: NonZeroU64,
    /// how often a keepalive is sent for each lease, defaults to a third of the TTL
    #[serde(default)]
    pub keepalive_interval_ms: Option<NonZeroU64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: None,
            lease_ttl_secs: default_lease_ttl_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            keepalive_interval_ms: None,
            log_level: default_log_level(),
            username: None,
            password: None,
        }
    }
}

impl Config {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        match Self::json(input.as_ref()) {
            Ok(r) => Ok(r),
            Err(_err) => Self::yaml(input.as_ref()),
        }
    }

    fn json(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("failed to parse config as JSON")
    }

    fn yaml(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context("failed to parse config as YAML")
    }
}

pub fn default_endpoints() -> Vec<String> {
    DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect()
}

pub const fn default_dial_timeout_ms() -> NonZeroU64 {
    NonZeroU64::new(5_000).unwrap()
}

pub const fn default_lease_ttl_secs() -> NonZeroU64 {
    NonZeroU64::new(5).unwrap()
}

pub const fn default_retry_backoff_ms() -> NonZeroU64 {
    NonZeroU64::new(1_000).unwrap()
}

pub fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let cfg = Config::new("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.endpoints.len(), 3);
        assert_eq!(cfg.lease_ttl_secs.get(), 5);
        assert_eq!(cfg.retry_backoff_ms.get(), 1_000);
    }

    #[test]
    fn test_yaml() {
        let input = r#"
endpoints:
  - "10.0.0.1:2379"
  - "10.0.0.2:2379"
dial_timeout_ms: 2000
lease_ttl_secs: 10
keepalive_interval_ms: 500
log_level: debug
"#;
        let cfg = Config::new(input).unwrap();
        assert_eq!(cfg.endpoints, vec!["10.0.0.1:2379", "10.0.0.2:2379"]);
        assert_eq!(cfg.dial_timeout_ms.get(), 2_000);
        assert_eq!(cfg.lease_ttl_secs.get(), 10);
        assert_eq!(cfg.keepalive_interval_ms.map(|v| v.get()), Some(500));
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.retry_backoff_ms, default_retry_backoff_ms());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(Config::new(r#"{"lease_ttl_secs": 0}"#).is_err());
    }
}

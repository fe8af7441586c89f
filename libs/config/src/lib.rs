//! # config
//!
//! Runtime configuration for the registration and discovery components:
//! the on-disk format ([`wire`]), command line & env parsing ([`cli`]), and
//! tracing setup ([`trace`]).
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use rand::{self, RngCore};
use tracing::debug;

pub mod cli;
pub mod env;
pub mod trace;
pub mod wire;

/// keepalives are sent this many times per TTL unless configured otherwise
const KEEPALIVES_PER_TTL: u32 = 3;
/// floor for the derived keepalive interval
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);
/// store credentials are only taken from the environment, never the command line
pub const USERNAME_VAR: &str = "ETCD_USERNAME";
pub const PASSWORD_VAR: &str = "ETCD_PASSWORD";

/// credentials for the coordination store
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// validated discovery config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    endpoints: Vec<String>,
    dial_timeout: Duration,
    request_timeout: Option<Duration>,
    lease_ttl: Duration,
    retry_backoff: Duration,
    keepalive_interval: Option<Duration>,
    log_level: String,
    credentials: Option<Credentials>,
    path: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: wire::default_endpoints(),
            dial_timeout: Duration::from_millis(wire::default_dial_timeout_ms().get()),
            request_timeout: None,
            lease_ttl: Duration::from_secs(wire::default_lease_ttl_secs().get()),
            retry_backoff: Duration::from_millis(wire::default_retry_backoff_ms().get()),
            keepalive_interval: None,
            log_level: wire::default_log_level(),
            credentials: None,
            path: None,
        }
    }
}

impl DiscoveryConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = wire::Config::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        debug!(?config);
        Self::from_wire(config, Some(path.to_path_buf()))
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let config = wire::Config::new(s.as_ref())?;
        debug!(?config);
        Self::from_wire(config, None)
    }

    /// Load from the config file named on the command line (if any), then
    /// apply the cli/env overrides on top
    pub fn from_cli(cli: &cli::Config) -> Result<Self> {
        let mut cfg = match &cli.config_path {
            Some(path) => Self::parse(path)?,
            None => Self::default(),
        };
        if !cli.endpoints.is_empty() {
            cfg.endpoints = cli.endpoints.clone();
        }
        if let Some(ms) = cli.dial_timeout_ms {
            if ms == 0 {
                bail!("--dial-timeout-ms must be greater than 0");
            }
            cfg.dial_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = cli.lease_ttl {
            if secs == 0 {
                bail!("--lease-ttl must be greater than 0");
            }
            cfg.lease_ttl = Duration::from_secs(secs);
            cfg.check_keepalive()?;
        }
        if let Some(ms) = cli.retry_backoff_ms {
            if ms == 0 {
                bail!("--retry-backoff-ms must be greater than 0");
            }
            cfg.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(log) = &cli.svcd_log {
            cfg.log_level = log.clone();
        }
        if let Some((username, password)) = env::parse_var_pair(USERNAME_VAR, PASSWORD_VAR)? {
            cfg.credentials = Some(Credentials { username, password });
        }
        Ok(cfg)
    }

    fn from_wire(cfg: wire::Config, path: Option<PathBuf>) -> Result<Self> {
        let endpoints = cfg
            .endpoints
            .into_iter()
            .map(|e| e.trim().to_owned())
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>();
        if endpoints.is_empty() {
            bail!("at least one coordination store endpoint is required");
        }
        let credentials = match (cfg.username, cfg.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => bail!("username and password must be configured together"),
        };
        let cfg = Self {
            endpoints,
            dial_timeout: Duration::from_millis(cfg.dial_timeout_ms.get()),
            request_timeout: cfg.request_timeout_ms.map(|ms| Duration::from_millis(ms.get())),
            lease_ttl: Duration::from_secs(cfg.lease_ttl_secs.get()),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms.get()),
            keepalive_interval: cfg
                .keepalive_interval_ms
                .map(|ms| Duration::from_millis(ms.get())),
            log_level: cfg.log_level,
            credentials,
            path,
        };
        cfg.check_keepalive()?;
        Ok(cfg)
    }

    /// a configured keepalive interval must leave room to renew before the lease lapses
    fn check_keepalive(&self) -> Result<()> {
        if let Some(interval) = self.keepalive_interval {
            if interval >= self.lease_ttl {
                bail!(
                    "keepalive interval ({interval:?}) must be shorter than the lease ttl ({:?})",
                    self.lease_ttl
                );
            }
        }
        Ok(())
    }

    /// Builder-style override of the endpoint list
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style override of the lease TTL
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Builder-style override of the resolver retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builder-style override of the keepalive interval
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// How often to renew a lease with the given TTL. Never more than half
    /// the TTL, whatever was configured.
    pub fn keepalive_interval(&self, ttl: Duration) -> Duration {
        self.keepalive_interval
            .unwrap_or_else(|| ttl / KEEPALIVES_PER_TTL)
            .max(MIN_KEEPALIVE_INTERVAL)
            .min(ttl / 2)
    }
}

/// Generate an instance id for a service when the operator didn't pick one
pub fn generate_instance_id(service: &str) -> String {
    let mut buf = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut buf);
    let suffix = buf.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("{service}-{suffix}")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::cli::Parser;

    #[test]
    fn test_defaults() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(
            cfg.endpoints(),
            ["localhost:23791", "localhost:23792", "localhost:23793"]
        );
        assert_eq!(cfg.dial_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.retry_backoff(), Duration::from_secs(1));
        assert_eq!(cfg.request_timeout(), None);
        assert_eq!(cfg.log_level(), "info");
        assert!(cfg.credentials().is_none());
        assert!(cfg.path().is_none());
    }

    #[test]
    fn test_keepalive_interval() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(
            cfg.keepalive_interval(Duration::from_secs(6)),
            Duration::from_secs(2)
        );
        // never spin faster than the floor
        assert_eq!(
            cfg.keepalive_interval(Duration::from_millis(240)),
            MIN_KEEPALIVE_INTERVAL
        );
        // but the floor never pushes past half the ttl
        assert_eq!(
            cfg.keepalive_interval(Duration::from_millis(30)),
            Duration::from_millis(15)
        );
        let cfg = cfg.with_keepalive_interval(Duration::from_millis(750));
        assert_eq!(
            cfg.keepalive_interval(Duration::from_secs(6)),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_keepalive_longer_than_ttl_is_clamped() {
        let cfg = DiscoveryConfig::default().with_keepalive_interval(Duration::from_secs(10));
        assert_eq!(
            cfg.keepalive_interval(Duration::from_secs(5)),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_keepalive_must_be_shorter_than_ttl() {
        assert!(
            DiscoveryConfig::parse_str(r#"{"lease_ttl_secs": 5, "keepalive_interval_ms": 10000}"#)
                .is_err()
        );
        assert!(
            DiscoveryConfig::parse_str(r#"{"lease_ttl_secs": 5, "keepalive_interval_ms": 5000}"#)
                .is_err()
        );
        let cfg =
            DiscoveryConfig::parse_str(r#"{"lease_ttl_secs": 5, "keepalive_interval_ms": 1000}"#)
                .unwrap();
        assert_eq!(
            cfg.keepalive_interval(cfg.lease_ttl()),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_from_cli_ttl_below_file_keepalive_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lease_ttl_secs: 10\nkeepalive_interval_ms: 2000").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let cli = cli::Config::try_parse_from([
            "svcd",
            "--config-path",
            &path,
            "--lease-ttl",
            "1",
            "list",
            "--service",
            "greeter",
        ])
        .unwrap();
        assert!(DiscoveryConfig::from_cli(&cli).is_err());
    }

    #[test]
    fn test_credentials_must_pair() {
        assert!(DiscoveryConfig::parse_str(r#"{"username": "root"}"#).is_err());
        let cfg =
            DiscoveryConfig::parse_str(r#"{"username": "root", "password": "hunter2"}"#).unwrap();
        let creds = cfg.credentials().unwrap();
        assert_eq!(creds.username, "root");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        assert!(DiscoveryConfig::parse_str(r#"{"endpoints": []}"#).is_err());
        assert!(DiscoveryConfig::parse_str(r#"{"endpoints": ["  "]}"#).is_err());
    }

    #[test]
    fn test_from_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "endpoints: [\"file:2379\"]\nlease_ttl_secs: 30\nretry_backoff_ms: 250"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let cli = cli::Config::try_parse_from([
            "svcd",
            "--config-path",
            &path,
            "--lease-ttl",
            "7",
            "list",
            "--service",
            "greeter",
        ])
        .unwrap();
        let cfg = DiscoveryConfig::from_cli(&cli).unwrap();
        assert_eq!(cfg.endpoints(), ["file:2379"]);
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(7));
        assert_eq!(cfg.retry_backoff(), Duration::from_millis(250));
        assert_eq!(cfg.path(), Some(file.path()));
    }

    #[test]
    fn test_from_cli_rejects_zero_ttl() {
        let cli = cli::Config::try_parse_from([
            "svcd",
            "--lease-ttl",
            "0",
            "list",
            "--service",
            "greeter",
        ])
        .unwrap();
        assert!(DiscoveryConfig::from_cli(&cli).is_err());
    }

    #[test]
    fn test_generate_instance_id() {
        let a = generate_instance_id("greeter");
        let b = generate_instance_id("greeter");
        assert!(a.starts_with("greeter-"));
        assert_eq!(a.len(), "greeter-".len() + 8);
        assert_ne!(a, b);
    }
}

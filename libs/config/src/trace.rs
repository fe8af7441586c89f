//! tracing configuration
use std::{fmt::Display, str::FromStr};

use anyhow::Result;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

use crate::env::parse_var_with_err;

/// env var selecting the log output format
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";
/// crates too chatty to log at any level
const QUIET_CRATES: [&str; 3] = ["hyper", "h2", "tower"];

/// How log lines are rendered
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// unstructured single line
    #[default]
    Standard,
    Json,
    /// multi-line, for humans
    Pretty,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log format {0:?}, expected one of standard, json, pretty")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "" => Ok(Self::Standard),
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(UnknownLogFormat(s.to_owned())),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Configuration for the global tracing subscriber
#[derive(Debug)]
pub struct Config {
    pub format: LogFormat,
    pub filter: String,
}

impl Config {
    /// Install the global subscriber. `log` accepts any `RUST_LOG` style
    /// filter and falls back to `info` when it doesn't parse.
    pub fn parse(log: &str) -> Result<Self> {
        let format: LogFormat = parse_var_with_err(LOG_FORMAT_VAR, LogFormat::default())?;
        let filter = filter(log)?;
        let shown = filter.to_string();

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init()?;
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .event_format(Format::default().pretty().with_source_location(false))
                            .fmt_fields(PrettyFields::new()),
                    )
                    .try_init()?;
            }
            LogFormat::Standard => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .try_init()?;
            }
        }

        Ok(Self {
            format,
            filter: shown,
        })
    }
}

fn filter(log: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(log).or_else(|_| EnvFilter::try_new("info"))?;
    for krate in QUIET_CRATES {
        filter = filter.add_directive(format!("{krate}=off").parse()?);
    }
    Ok(filter)
}

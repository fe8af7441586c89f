//! Parse from either cli or env var

/// Default external api
pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "svcd-worker";

use std::{net::SocketAddr, path::PathBuf};

pub use clap::Parser;
use clap::Subcommand;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "svcd", bin_name = "svcd", about, long_about = None)]
/// parses from cli & environment var. svcd will load `.env` in the working dir as well
pub struct Config {
    /// path to a JSON or YAML config file, built-in defaults are used without one
    #[clap(short, long, value_parser, env)]
    pub config_path: Option<PathBuf>,
    /// coordination store endpoints, comma separated
    #[clap(long, env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    pub endpoints: Vec<String>,
    /// dial timeout for the coordination store
    #[clap(long, env, value_parser)]
    pub dial_timeout_ms: Option<u64>,
    /// lease TTL for registered instances
    #[clap(long, env, value_parser)]
    pub lease_ttl: Option<u64>,
    /// backoff between failed resolver reads
    #[clap(long, env, value_parser)]
    pub retry_backoff_ms: Option<u64>,
    /// use an in-process store instead of connecting to the coordination store
    #[clap(long, env)]
    pub memory: bool,
    /// the address for the health/metrics api
    #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
    pub external_api: SocketAddr,
    /// Worker thread name
    #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    /// number of worker threads, defaults to the number of logical CPUs
    #[clap(long, env, value_parser)]
    pub threads: Option<usize>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env)]
    pub svcd_log: Option<String>,
    #[clap(subcommand)]
    pub command: Command,
}

/// what svcd should do once connected
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// register an instance and keep its lease alive until ctrl-c
    Serve {
        /// logical service name
        #[clap(long)]
        service: String,
        /// instance id, generated when omitted
        #[clap(long)]
        instance: Option<String>,
        /// the `host:port` clients should dial
        #[clap(long)]
        addr: String,
    },
    /// print every address set pushed for a service until ctrl-c
    Resolve {
        #[clap(long)]
        service: String,
    },
    /// print the current address set for a service
    List {
        #[clap(long)]
        service: String,
    },
    /// remove an instance's record
    Deregister {
        #[clap(long)]
        service: String,
        #[clap(long)]
        instance: String,
    },
}

impl Command {
    /// the service name every subcommand operates on
    pub fn service(&self) -> &str {
        match self {
            Command::Serve { service, .. }
            | Command::Resolve { service }
            | Command::List { service }
            | Command::Deregister { service, .. } => service,
        }
    }
}

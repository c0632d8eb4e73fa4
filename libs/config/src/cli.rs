//! Parse from either cli or env var
use std::path::PathBuf;

use anyhow::{Context, Result};
pub use clap::Parser;

use crate::{CoordinationConfig, trace::DEFAULT_LOG_FORMAT};

/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "copresence-worker";
/// service the agent joins when none is given
pub static DEFAULT_SERVICE_NAME: &str = "dcell_presence";
/// default log level. Can use this argument or COPRESENCE_LOG env var
pub const DEFAULT_COPRESENCE_LOG: &str = "info";
/// server name used by `--in-memory` when no servers are given
pub const IN_MEMORY_SERVER: &str = "in-memory";
/// seconds between directory reports
pub const DEFAULT_REPORT_INTERVAL: u64 = 30;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "copresence", bin_name = "copresence", about, long_about = None)]
/// parses from cli & environment var. copresence will load `.env` in the working dir as well
pub struct Config {
    /// path to a JSON/YAML coordination config, cli values override it
    #[clap(short, long, value_parser, env = "COPRESENCE_CONFIG")]
    pub config_path: Option<PathBuf>,
    /// comma separated coordination servers, `host` or `host:port`
    #[clap(long, env = "COPRESENCE_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,
    /// environment segment of every namespace path
    #[clap(long, env = "COPRESENCE_ENV")]
    pub env: Option<String>,
    /// membership namespace to join
    #[clap(long, env = "COPRESENCE_SERVICE", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,
    /// application level id published with our address, random if unset
    #[clap(long, env = "COPRESENCE_NODE_ID")]
    pub node_id: Option<String>,
    /// address to publish, the first local interface address if unset
    #[clap(long, env = "COPRESENCE_ADDRESS")]
    pub address: Option<String>,
    /// prefer an IPv6 interface address when `address` is unset
    #[clap(long, env = "COPRESENCE_IPV6")]
    pub ipv6: bool,
    /// use an in-process coordination service instead of connecting out
    #[clap(long, env = "COPRESENCE_IN_MEMORY")]
    pub in_memory: bool,
    /// seconds between directory reports
    #[clap(long, env, value_parser, default_value_t = DEFAULT_REPORT_INTERVAL)]
    pub report_interval: u64,
    /// number of tokio worker threads, defaults to logical cpu count
    #[clap(long, env = "COPRESENCE_THREADS")]
    pub threads: Option<usize>,
    /// Worker thread name
    #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env, value_parser, default_value = DEFAULT_COPRESENCE_LOG)]
    pub copresence_log: String,
    /// log as "json", "pretty" or "standard"
    #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
    pub log_format: String,
}

impl Config {
    /// Build the coordination config: file first, then cli overrides
    pub fn coordination(&self) -> Result<CoordinationConfig> {
        let mut cfg = match &self.config_path {
            Some(path) => CoordinationConfig::parse(path)?,
            // nothing dials out in-memory, any placeholder server will do
            None if self.in_memory && self.servers.is_empty() => {
                CoordinationConfig::new([IN_MEMORY_SERVER])
            }
            None => CoordinationConfig::new(self.servers.clone()),
        };
        if self.config_path.is_some() && !self.servers.is_empty() {
            cfg.servers = self.servers.clone();
        }
        if let Some(env) = &self.env {
            cfg.env = env.clone();
        }
        cfg.validate().context("invalid coordination config")?;
        Ok(cfg)
    }

    /// the configured node id or a random one
    pub fn effective_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("copresence-{:08x}", rand::random::<u32>()))
    }
}

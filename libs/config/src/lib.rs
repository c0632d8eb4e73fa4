//! # config
//!
//! Configuration for copresence: the coordination-service file config, CLI
//! arguments, tracing setup and the local interface address query used as the
//! default presence address.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod cli;
pub mod net;
pub mod trace;
pub mod wire;

pub use net::local_ip;

/// Coordination-service connection config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// server list, entries may omit the port
    pub servers: Vec<String>,
    /// environment segment used in every namespace path
    pub env: String,
    /// session timeout negotiated with the service
    pub session_timeout: Duration,
    /// capacity of the internal mpsc/broadcast channels
    pub channel_size: usize,
    path: Option<PathBuf>,
}

impl CoordinationConfig {
    /// Config for the given servers with every other field defaulted
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            env: wire::DEFAULT_ENV.to_owned(),
            session_timeout: Duration::from_secs(wire::default_session_timeout()),
            channel_size: wire::default_channel_size(),
            path: None,
        }
    }

    /// Replace the environment segment
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    /// Replace the session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Replace the channel capacity
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(raw)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let wire = wire::Config::from_str(s.as_ref())?;
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    /// path the config was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Check the config is usable. Missing servers are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.servers.iter().all(|s| s.trim().is_empty()) {
            bail!("no coordination servers given");
        }
        if self.env.trim().is_empty() || self.env.contains('/') {
            bail!("invalid env {:?}: must be a single non-empty path segment", self.env);
        }
        if self.channel_size == 0 {
            bail!("channel_size must be greater than zero");
        }
        Ok(())
    }
}

impl TryFrom<wire::Config> for CoordinationConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        // a single `server` wins over the `servers` list
        let servers = match (cfg.server, cfg.servers) {
            (Some(server), _) => vec![server],
            (None, Some(servers)) => servers,
            (None, None) => Vec::new(),
        };
        let config = Self {
            servers,
            env: cfg.env,
            session_timeout: Duration::from_secs(cfg.session_timeout),
            channel_size: cfg.channel_size,
            path: None,
        };
        config.validate()?;
        Ok(config)
    }
}

//! On-disk shape of the coordination config
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// environment used when none is configured
pub const DEFAULT_ENV: &str = "production";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// a single server, takes precedence over `servers`
    pub server: Option<String>,
    pub servers: Option<Vec<String>>,
    #[serde(default = "default_env")]
    pub env: String,
    /// seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

impl Config {
    /// JSON first, then YAML
    pub fn from_str(s: &str) -> Result<Self> {
        match serde_json::from_str(s) {
            Ok(cfg) => Ok(cfg),
            Err(_) => serde_yaml::from_str(s).context("failed to parse config as JSON or YAML"),
        }
    }
}

pub fn default_env() -> String {
    DEFAULT_ENV.to_owned()
}

pub const fn default_session_timeout() -> u64 {
    10
}

pub const fn default_channel_size() -> usize {
    1_024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let cfg = Config::from_str("servers: [a, b]").unwrap();
        assert_eq!(cfg.servers, Some(vec!["a".to_owned(), "b".to_owned()]));
        assert_eq!(cfg.server, None);
        assert_eq!(cfg.env, DEFAULT_ENV);
        assert_eq!(cfg.session_timeout, default_session_timeout());
        assert_eq!(cfg.channel_size, default_channel_size());
    }

    #[test]
    fn test_garbage_fails() {
        assert!(Config::from_str("servers: [a").is_err());
    }
}

//! tracing configuration
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

/// log as "json", "pretty" or "standard" (unstructured)
pub static DEFAULT_LOG_FORMAT: &str = "standard";

/// Installed tracing configuration
#[derive(Debug)]
pub struct Config {
    /// formatting to apply to logs
    pub log_frmt: String,
}

impl Config {
    /// Install the global subscriber. `log` accepts any valid RUST_LOG directive.
    pub fn parse(log: &str, log_frmt: &str) -> Result<Self> {
        let filter = EnvFilter::try_new(log).or_else(|_| EnvFilter::try_new("info"))?;

        match log_frmt {
            "json" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .event_format(Format::default().pretty().with_source_location(false))
                            .fmt_fields(PrettyFields::new()),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .init();
            }
        }

        Ok(Self {
            log_frmt: log_frmt.to_owned(),
        })
    }
}

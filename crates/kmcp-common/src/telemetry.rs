//! Tracing subscriber setup
//!
//! Logs go to stderr so stdio-based MCP transports keep stdout clean.
//! `RUST_LOG` overrides the default filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str =
    "info,kmcp=debug,kmcp_common=debug,kmcp_access=debug,kmcp_cluster=debug,kube=info,tower=warn,hyper=warn";

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Telemetry settings
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Line format
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset; falls back to [`DEFAULT_FILTER`]
    pub default_filter: Option<String>,
}

/// Install the global tracing subscriber
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let fallback = config
        .default_filter
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|e| Error::Telemetry(e.to_string()))
}

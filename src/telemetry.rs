//! Logging setup
//!
//! Plain `tracing` output to stderr. Set `E2E_LOG_FORMAT=json` when the run is
//! collected by a CI log pipeline.
//!
//! # Example
//!
//! ```no_run
//! use discovery_e2e::telemetry::init_logging;
//!
//! init_logging();
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log format (`text` or `json`)
pub const ENV_LOG_FORMAT: &str = "E2E_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info,kube=warn,hyper=warn";

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to text for anything unknown
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Initialize logging with tracing-subscriber
///
/// Uses `RUST_LOG` for filtering and `E2E_LOG_FORMAT` for the format.
/// Safe to call more than once.
pub fn init_logging() {
    let format = std::env::var(ENV_LOG_FORMAT)
        .map(|v| LogFormat::parse(&v))
        .unwrap_or_default();
    init_logging_with(format);
}

/// Initialize logging with an explicit format
pub fn init_logging_with(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let _ = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_init_logging() {
        // Should not panic when called multiple times
        init_logging();
        init_logging_with(LogFormat::Json);
    }
}

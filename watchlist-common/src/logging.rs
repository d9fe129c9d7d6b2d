//! Logging setup for the watchlist binary.
//!
//! Noisy library modules (hyper, reqwest, h2, rustls) are held at `warn`
//! so pipeline logs stay readable. `RUST_LOG` overrides everything.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::ConfigSource;

/// Modules forced to `warn` unless `RUST_LOG` says otherwise.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tokio_util",
];

/// Log level and output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Read `LOG_LEVEL` and `LOG_FORMAT`.
    pub fn from_source(source: &ConfigSource) -> Self {
        let defaults = Self::default();
        Self {
            level: source
                .get("LOG_LEVEL")
                .map(str::to_lowercase)
                .unwrap_or(defaults.level),
            format: source
                .get("LOG_FORMAT")
                .map(str::to_lowercase)
                .unwrap_or(defaults.format),
        }
    }
}

fn build_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }

    EnvFilter::new(&directives)
}

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    let filter = build_filter(&config.level);
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );
}

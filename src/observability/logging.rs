//! Structured logging built on `tracing`
//!
//! Output goes to stderr so `mqtt-pipe consume` can keep stdout for message
//! payloads.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE; defaults to INFO
//! - `LOG_FORMAT`: `json`, `pretty` or `compact`; defaults to json
//! - `LOG_SPANS`: `true` adds span open/close events
//! - `RUST_LOG`: full filter override in env_logger syntax
//!
//! ```bash
//! LOG_FORMAT=compact LOG_LEVEL=DEBUG mqtt-pipe consume -t 'sensors/#'
//! RUST_LOG=mqtt_connector=trace,rumqttc=debug mqtt-pipe produce -t alerts hello
//! ```

use std::env;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    #[default]
    Json,
    /// Multi-line, coloured
    Pretty,
    /// Single-line, coloured, without targets
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Unknown names fall back to JSON
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        })
    }
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Dependency targets that are only interesting when something breaks
const QUIET_TARGETS: [&str; 2] = ["rumqttc=warn", "tokio=warn"];

fn level_filter(level: Level) -> EnvFilter {
    QUIET_TARGETS
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Parse a log level name, defaulting to INFO
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

/// Install the global subscriber; later calls are ignored
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => level_filter(level),
    };

    let span_events = if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let level = env::var("LOG_LEVEL")
        .map(|value| parse_level(&value))
        .unwrap_or(Level::INFO);
    let format = env::var("LOG_FORMAT")
        .map(|value| LogFormat::parse(&value))
        .unwrap_or_default();
    let include_spans = env::var("LOG_SPANS").is_ok_and(|value| value.eq_ignore_ascii_case("true"));

    init_logging(level, format, include_spans);
}

/// Span around a single MQTT request (subscribe, publish, ...)
#[macro_export]
macro_rules! mqtt_span {
    ($operation:expr $(, $($field:tt)*)?) => {
        tracing::info_span!("mqtt_operation", operation = $operation $(, $($field)*)?)
    };
}

/// Span around a connection lifecycle step
#[macro_export]
macro_rules! lifecycle_span {
    ($step:expr $(, $($field:tt)*)?) => {
        tracing::info_span!("lifecycle_event", step = $step $(, $($field)*)?)
    };
}

pub use {lifecycle_span, mqtt_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        let cases = [
            ("json", LogFormat::Json),
            ("Pretty", LogFormat::Pretty),
            (" COMPACT\n", LogFormat::Compact),
            ("xml", LogFormat::Json),
            ("", LogFormat::Json),
        ];
        for (input, expected) in cases {
            assert_eq!(LogFormat::parse(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Debug", Level::DEBUG),
            ("trace ", Level::TRACE),
            ("loud", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_quiet_targets_are_valid_directives() {
        for directive in QUIET_TARGETS {
            assert!(directive.parse::<Directive>().is_ok(), "{directive}");
        }
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(Level::WARN, LogFormat::Compact, false);
        init_logging(Level::DEBUG, LogFormat::Json, true);

        let span = crate::mqtt_span!("publish", topic = "a/b");
        let _entered = span.enter();
        tracing::info!("still logging");
    }

    #[test]
    fn test_span_macros_take_operation_and_fields() {
        let topic = "sensors/temp";
        let id = uuid::Uuid::new_v4();

        let bare = crate::mqtt_span!("subscribe");
        let with_display = crate::mqtt_span!("publish", topic = %topic, message_id = %id);
        let lifecycle = crate::lifecycle_span!("close", unique_id = %"pipeline");

        for span in [bare, with_display, lifecycle] {
            let _entered = span.enter();
            tracing::debug!("inside span");
        }
    }
}

//! Structured logging using the tracing crate
//!
//! Span macros give every dispatch, consumer and shutdown event a consistent
//! name so log pipelines can group them.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE. Defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact. Defaults to json
//! - `LOG_SPANS`: emit span open/close events (true/false). Defaults to false
//! - `RUST_LOG`: replaces the computed filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG silk-engine run -c engine.toml
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose INFO output drowns out the engine's own
const NOISY_CRATES: &[&str] = &["rumqttc", "hyper", "warp", "redis", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON (machine-readable)
    Json,
    /// Multi-line, coloured (human-readable)
    Pretty,
    /// Single-line, coloured (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Filter for `level` with noisy dependencies clamped to WARN
pub fn build_filter(level: Level) -> EnvFilter {
    NOISY_CRATES.iter().fold(
        EnvFilter::new(level.to_string()),
        |filter, krate| match format!("{krate}=warn").parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    )
}

/// Initialize logging with explicit settings
///
/// A second call is a no-op: the first installed subscriber wins.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => build_filter(level),
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized, keeping existing subscriber");
    }
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span covering one record's dispatch
#[macro_export]
macro_rules! dispatch_span {
    ($($field:tt)*) => {
        tracing::info_span!("dispatch", $($field)*)
    };
}

/// Span covering one consumer's loop or stop sequence
#[macro_export]
macro_rules! consumer_span {
    ($($field:tt)*) => {
        tracing::info_span!("consumer", $($field)*)
    };
}

/// Span covering the coordinated shutdown sequence
#[macro_export]
macro_rules! shutdown_span {
    ($($field:tt)*) => {
        tracing::info_span!("shutdown", $($field)*)
    };
}

pub use {consumer_span, dispatch_span, shutdown_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_unknown_defaults_to_json() {
        for input in ["", "xml", "yaml", "invalid"] {
            assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input}");
        }
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("verbose", Level::INFO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_filter_clamps_noisy_crates() {
        let rendered = build_filter(Level::DEBUG).to_string();
        for krate in NOISY_CRATES {
            assert!(rendered.contains(&format!("{krate}=warn")), "{rendered}");
        }
    }

    #[test]
    fn test_span_macros_build() {
        let span = dispatch_span!(topic = "orders", partition = 0, offset = 1);
        let _guard = span.enter();
        let _consumer = consumer_span!(topic = "orders");
        let _shutdown = shutdown_span!(reason = "signal");
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(Level::INFO, LogFormat::Compact, false);
        init_logging(Level::DEBUG, LogFormat::Json, true);
    }
}

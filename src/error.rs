//! Error taxonomy for the dispatch runtime
//!
//! Per-record failures (decode, agent execution) are recoverable and never
//! leave the consumption loop. Subscription failures and process faults are
//! the only classes allowed to end the process, and both go through the
//! coordinated drain first. [`App`](crate::App) returns this type from every
//! fallible operation.

use crate::dispatch::AgentFailure;
use crate::broker::BrokerError;
use crate::cache::CacheError;
use crate::consumer::ConsumerError;
use crate::message::DecodeError;
use crate::shutdown::ShutdownError;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Crate-level error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Agent execution error: {0}")]
    AgentExecution(#[from] AgentFailure),

    #[error("Subscription error on topic {topic}: {message}")]
    Subscription { topic: String, message: String },

    #[error("Shutdown timed out after {elapsed:?}")]
    ShutdownTimeout { elapsed: Duration },

    #[error("Process fault: {message}")]
    ProcessFault { message: String },

    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Agents must be registered before any consumer starts")]
    RegistrationClosed,

    #[error("No consumer for topic '{0}'")]
    UnknownTopic(String),

    #[error("HTTP server error: {0}")]
    Server(#[from] warp::Error),

    #[error("Signal handling error: {0}")]
    Signals(#[from] std::io::Error),
}

impl EngineError {
    /// Create subscription error
    pub fn subscription<T: Into<String>, M: Into<String>>(topic: T, message: M) -> Self {
        Self::Subscription {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create process fault error
    pub fn process_fault<S: Into<String>>(message: S) -> Self {
        Self::ProcessFault {
            message: message.into(),
        }
    }

    /// Subscription failures become [`EngineError::Subscription`]; anything
    /// else stays a consumer error
    pub fn from_start(error: ConsumerError) -> Self {
        match error {
            ConsumerError::Subscription { topic, source } => {
                Self::subscription(topic, source.to_string())
            }
            other => Self::Consumer(other),
        }
    }

    /// Errors that must never terminate consumption or the process
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Decode(_)
            | EngineError::AgentExecution(_)
            | EngineError::ShutdownTimeout { .. } => true,
            EngineError::Consumer(e) => !matches!(e, ConsumerError::Subscription { .. }),
            _ => false,
        }
    }

    /// Sanitized message suitable for structured logs
    pub fn log_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex is valid")
    })
}

fn secret_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
            .expect("static regex is valid")
    })
}

/// Redact credentials and secret-looking paths from text headed for logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = secret_pattern()
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = secret_path_pattern()
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    // Keep total length <= 500 bytes
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

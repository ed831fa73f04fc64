//! Observability: structured logging, metrics and the health/admin server

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{AgentOutcome, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{consumer_span, dispatch_span, shutdown_span};

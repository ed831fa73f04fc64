//! Consumer-group lifecycle: one subscription feeding the dispatch engine
//!
//! A [`ConsumerLifecycle`] moves through `Created → Running → Draining →
//! Stopped`. Once stopped it may be started again with a fresh subscription.

mod commit;
mod lifecycle;

pub use commit::CommitTracker;
pub use lifecycle::ConsumerLifecycle;

use crate::broker::BrokerError;
use crate::config::ConsumerSection;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle state of one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Running => "running",
            ConsumerState::Draining => "draining",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of a `stop()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Never started; nothing to do
    NotStarted,
    /// A previous stop (or the end of the stream) already finished the consumer
    AlreadyStopped,
    /// All in-flight dispatches finished within the drain budget
    Drained,
    /// The drain budget elapsed; the consumer is marked stopped regardless
    TimedOut { in_flight: usize },
}

impl StopOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StopOutcome::TimedOut { .. })
    }

    /// Whether this call did the draining work
    pub fn drained_now(&self) -> bool {
        matches!(self, StopOutcome::Drained | StopOutcome::TimedOut { .. })
    }
}

/// Consumer lifecycle failures
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The initial subscription could not be established
    #[error("Failed to subscribe to '{topic}': {source}")]
    Subscription {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("Consumer for '{topic}' cannot {operation} while {state}")]
    InvalidState {
        topic: String,
        operation: &'static str,
        state: ConsumerState,
    },
}

/// Consumption loop settings
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Await each record's dispatch before pulling the next
    pub ordered: bool,
    /// Concurrent dispatches in unordered mode
    pub max_in_flight: usize,
    /// Budget for `stop()`
    pub drain_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&ConsumerSection::default())
    }
}

impl From<&ConsumerSection> for ConsumerSettings {
    fn from(section: &ConsumerSection) -> Self {
        Self {
            ordered: section.ordered,
            max_in_flight: section.max_in_flight.max(1),
            drain_timeout: section.drain_timeout(),
        }
    }
}

impl ConsumerSettings {
    pub fn unordered(max_in_flight: usize) -> Self {
        Self {
            ordered: false,
            max_in_flight: max_in_flight.max(1),
            ..Self::default()
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Per-consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub records: u64,
    pub decode_errors: u64,
    pub agent_failures: u64,
    pub commits: u64,
    pub commit_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_section() {
        let section = ConsumerSection {
            ordered: false,
            max_in_flight: 0,
            handler_timeout_ms: 0,
            drain_timeout_ms: 250,
        };
        let settings = ConsumerSettings::from(&section);

        assert!(!settings.ordered);
        assert_eq!(settings.max_in_flight, 1);
        assert_eq!(settings.drain_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_stop_outcome_classification() {
        assert!(StopOutcome::TimedOut { in_flight: 2 }.is_timeout());
        assert!(StopOutcome::TimedOut { in_flight: 2 }.drained_now());
        assert!(StopOutcome::Drained.drained_now());
        assert!(!StopOutcome::AlreadyStopped.drained_now());
        assert!(!StopOutcome::NotStarted.is_timeout());
    }

    #[test]
    fn test_invalid_state_message() {
        let error = ConsumerError::InvalidState {
            topic: "orders".to_string(),
            operation: "start",
            state: ConsumerState::Draining,
        };
        assert_eq!(
            error.to_string(),
            "Consumer for 'orders' cannot start while draining"
        );
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConsumerState::Running).unwrap();
        assert_eq!(json, "\"running\"");

        let json = serde_json::to_value(StopOutcome::TimedOut { in_flight: 3 }).unwrap();
        assert_eq!(json["outcome"], "timed_out");
        assert_eq!(json["in_flight"], 3);
    }
}

use crate::agent::AgentId;
use crate::message::RecordPosition;
use std::time::Duration;
use thiserror::Error;

/// Why one agent invocation did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentFailureKind {
    /// The handler returned an error
    #[error("failed: {0}")]
    Failed(String),
    /// The handler panicked; siblings were unaffected
    #[error("panicked: {0}")]
    Panicked(String),
    /// The handler exceeded the engine's per-handler timeout
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// One isolated agent failure for one record
#[derive(Debug, Clone, Error)]
#[error("agent '{agent}' ({agent_id}) {kind}")]
pub struct AgentFailure {
    pub agent: String,
    pub agent_id: AgentId,
    pub kind: AgentFailureKind,
}

impl AgentFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, AgentFailureKind::TimedOut(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self.kind, AgentFailureKind::Panicked(_))
    }
}

/// Outcome of dispatching one record to every matching agent
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub position: RecordPosition,
    /// Agents the registry returned for the topic
    pub matched: usize,
    pub succeeded: usize,
    pub failures: Vec<AgentFailure>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn topic(&self) -> &str {
        &self.position.topic
    }

    pub fn partition(&self) -> i32 {
        self.position.partition
    }

    pub fn offset(&self) -> i64 {
        self.position.offset
    }

    /// No agent was registered for the topic
    pub fn is_noop(&self) -> bool {
        self.matched == 0
    }

    /// Every matched agent succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

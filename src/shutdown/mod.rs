//! Coordinated process shutdown
//!
//! Every termination source (OS signals, the panic hook, the admin HTTP
//! route, a failed startup) fires the same [`ShutdownTrigger`]. The host
//! waits for the first reason and hands it to the [`ShutdownCoordinator`],
//! which stops every registered [`Drain`] concurrently, then the HTTP
//! server, and reports how it went.

mod coordinator;
mod trigger;

pub use coordinator::{ServerHandle, ShutdownCoordinator};
pub use trigger::{install_panic_hook, spawn_signal_listener, ShutdownTrigger, SignalListener};

use crate::consumer::StopOutcome;
use crate::error::EngineError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Anything the coordinator stops during shutdown
#[async_trait]
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;

    /// Stop taking new work and finish what is in flight
    async fn drain(&self) -> StopOutcome;
}

/// Why the process is shutting down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// OS signal, e.g. `SIGTERM`
    Signal(String),
    /// Requested through the admin endpoint or the API
    Administrative,
    /// Unrecoverable process fault
    Fault(String),
}

impl ShutdownReason {
    pub fn is_fault(&self) -> bool {
        matches!(self, ShutdownReason::Fault(_))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_fault() {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {name}"),
            ShutdownReason::Administrative => f.write_str("administrative request"),
            ShutdownReason::Fault(message) => write!(f, "fault: {message}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Registration is closed; the server is already serving")]
    Sealed,
    #[error("Shutdown already in progress")]
    InProgress,
}

/// What happened during one shutdown sequence
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Outcome per drain that reported before the deadline
    pub consumers: Vec<(String, StopOutcome)>,
    /// Drains still running when the deadline elapsed
    pub pending: Vec<String>,
    pub server_stopped: bool,
    pub timed_out: bool,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// 0 for signal or administrative shutdown, 1 for a fault
    pub fn exit_code(&self) -> i32 {
        self.reason.exit_code()
    }

    pub fn outcome_of(&self, name: &str) -> Option<StopOutcome> {
        self.consumers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| *outcome)
    }

    /// A drain that ran out of budget, then the fault that caused the
    /// shutdown, if any
    pub fn errors(&self) -> Vec<EngineError> {
        let mut errors = Vec::new();
        let drain_timed_out = self
            .consumers
            .iter()
            .any(|(_, outcome)| matches!(outcome, StopOutcome::TimedOut { .. }));
        if self.timed_out || drain_timed_out {
            errors.push(EngineError::ShutdownTimeout {
                elapsed: self.elapsed,
            });
        }
        if let ShutdownReason::Fault(message) = &self.reason {
            errors.push(EngineError::process_fault(message.clone()));
        }
        errors
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::Signal("SIGTERM".to_string()).exit_code(), 0);
        assert_eq!(ShutdownReason::Administrative.exit_code(), 0);
        assert_eq!(ShutdownReason::Fault("boom".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            ShutdownReason::Signal("SIGINT".to_string()).to_string(),
            "signal SIGINT"
        );
        assert_eq!(
            ShutdownReason::Fault("oops".to_string()).to_string(),
            "fault: oops"
        );
    }

    #[test]
    fn test_report_serializes() {
        let report = ShutdownReport {
            reason: ShutdownReason::Administrative,
            consumers: vec![("orders".to_string(), StopOutcome::Drained)],
            pending: Vec::new(),
            server_stopped: true,
            timed_out: false,
            elapsed: Duration::from_millis(42),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["reason"]["kind"], "administrative");
        assert_eq!(json["elapsed"], 42);
        assert_eq!(json["consumers"][0][0], "orders");
        assert_eq!(report.outcome_of("orders"), Some(StopOutcome::Drained));
        assert_eq!(report.exit_code(), 0);
        assert!(report.errors().is_empty());
    }

    #[test]
    fn test_report_errors_classify_timeout_and_fault() {
        let report = ShutdownReport {
            reason: ShutdownReason::Fault("worker died".to_string()),
            consumers: vec![("orders".to_string(), StopOutcome::TimedOut { in_flight: 2 })],
            pending: Vec::new(),
            server_stopped: true,
            timed_out: false,
            elapsed: Duration::from_millis(500),
        };

        let errors = report.errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], EngineError::ShutdownTimeout { .. }));
        assert!(errors[0].is_recoverable());
        assert!(matches!(&errors[1], EngineError::ProcessFault { message } if message == "worker died"));
        assert!(!errors[1].is_recoverable());
    }
}

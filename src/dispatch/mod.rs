//! Per-record fan-out to every agent registered on the record's topic

mod engine;
mod report;

pub use engine::{in_agent_handler, DispatchEngine};
pub use report::{AgentFailure, AgentFailureKind, DispatchReport};

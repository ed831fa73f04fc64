//! Agents and the topic routing table
//!
//! An [`Agent`] binds a topic, a payload shape and an async handler. The
//! [`AgentRegistry`] maps each topic to the agents subscribed to it, in
//! registration order.

pub mod context;
pub mod definition;
pub mod registry;

pub use context::AgentContext;
pub use definition::{Agent, AgentHandler, AgentId, HandlerError};
pub use registry::{AgentList, AgentRegistry};

//! Silk Engine - topic-routed agent dispatch
//!
//! A runtime that attaches to a consumer-group broker, decodes each record's
//! JSON payload once and fans it out to every agent registered on the
//! record's topic. Agents run concurrently and fail independently.
//!
//! # Overview
//!
//! - [`agent`]: agents, handler context and the topic registry
//! - [`dispatch`]: per-record fan-out with failure isolation
//! - [`consumer`]: consumer-group lifecycle and offset commits
//! - [`broker`]: MQTT v5 shared subscriptions and an in-memory broker
//! - [`cache`]: in-memory and Redis caches handed to handlers
//! - [`shutdown`]: signal handling and the coordinated drain
//! - [`app`]: the host process tying it all together
//!
//! # Quick Start
//!
//! ```rust
//! use serde_json::Value;
//! use silk_engine::agent::{Agent, AgentContext, AgentRegistry, HandlerError};
//! use silk_engine::dispatch::DispatchEngine;
//! use silk_engine::message::{MessageEnvelope, PayloadShape};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(AgentRegistry::new());
//! registry.register(Arc::new(Agent::from_fn(
//!     "orders",
//!     PayloadShape::any(),
//!     |payload: Arc<Value>, _ctx: AgentContext| async move {
//!         println!("order {}", payload["orderid"]);
//!         Ok::<(), HandlerError>(())
//!     },
//! )));
//!
//! let engine = DispatchEngine::new(registry);
//! let record = MessageEnvelope::new("orders", 0, 0, None, r#"{"orderid": 18}"#);
//! let report = tokio_test::block_on(engine.dispatch(record)).unwrap();
//! assert_eq!(report.succeeded, 1);
//! ```

pub mod agent;
pub mod app;
pub mod broker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod observability;
pub mod shutdown;
pub mod testing;

pub use agent::{Agent, AgentContext, AgentRegistry, HandlerError};
pub use app::{App, AppBuilder, StartupPolicy};
pub use config::EngineConfig;
pub use consumer::{ConsumerLifecycle, ConsumerState, StopOutcome};
pub use dispatch::{DispatchEngine, DispatchReport};
pub use error::{EngineError, EngineResult};
pub use message::{MessageEnvelope, PayloadShape};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownReport, ShutdownTrigger};

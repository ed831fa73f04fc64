//! Panic hook behaviour
//!
//! Kept in its own test binary: the hook is process-wide.

use silk_engine::agent::AgentRegistry;
use silk_engine::dispatch::DispatchEngine;
use silk_engine::message::MessageEnvelope;
use silk_engine::shutdown::{install_panic_hook, ShutdownReason, ShutdownTrigger};
use silk_engine::testing::panicking_agent;
use std::sync::Arc;

#[tokio::test]
async fn test_only_panics_outside_handlers_fire_a_fault() {
    let trigger = ShutdownTrigger::new();
    install_panic_hook(trigger.clone());

    let registry = Arc::new(AgentRegistry::new());
    registry.register(Arc::new(panicking_agent("orders")));
    let engine = DispatchEngine::new(registry);

    let report = engine
        .dispatch(MessageEnvelope::new("orders", 0, 0, None, "{}"))
        .await
        .unwrap();
    assert!(report.failures[0].is_panic());
    assert!(trigger.fired().is_none(), "handler panics stay isolated");

    let crashed = tokio::spawn(async {
        panic!("background worker crashed");
    })
    .await;
    assert!(crashed.is_err());

    match trigger.fired() {
        Some(ShutdownReason::Fault(message)) => {
            assert!(message.contains("background worker crashed"))
        }
        other => panic!("expected a fault, got {other:?}"),
    }
}

//! End-to-end dispatch behaviour
//!
//! Drives the dispatch engine directly with hand-built envelopes and checks
//! what handlers observe: fan-out, failure isolation and decode failures.

use serde::Deserialize;
use serde_json::Value;
use silk_engine::agent::{Agent, AgentContext, AgentRegistry, HandlerError};
use silk_engine::cache::{CacheHandle, InMemoryCache};
use silk_engine::dispatch::{AgentFailureKind, DispatchEngine};
use silk_engine::message::{MessageEnvelope, PayloadShape};
use silk_engine::observability::MetricsCollector;
use silk_engine::testing::{failing_agent, panicking_agent, Recorder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn record(topic: &str, offset: i64, payload: &'static str) -> MessageEnvelope {
    MessageEnvelope::new(topic, 0, offset, None, payload)
}

fn engine_with(agents: Vec<Agent>) -> (DispatchEngine, Arc<MetricsCollector>) {
    let registry = Arc::new(AgentRegistry::new());
    for agent in agents {
        registry.register(Arc::new(agent));
    }
    let metrics = Arc::new(MetricsCollector::new());
    (
        DispatchEngine::new(registry).with_metrics(metrics.clone()),
        metrics,
    )
}

fn order_accumulator(orders: Arc<Mutex<Vec<i64>>>) -> Agent {
    Agent::from_fn(
        "orders",
        PayloadShape::any(),
        move |payload: Arc<Value>, _ctx: AgentContext| {
            let orders = orders.clone();
            async move {
                let id = payload["orderid"].as_i64().ok_or("orderid missing")?;
                orders.lock().await.push(id);
                Ok::<(), HandlerError>(())
            }
        },
    )
    .with_name("accumulator")
}

#[tokio::test]
async fn test_order_is_accumulated_exactly_once() {
    let orders = Arc::new(Mutex::new(Vec::new()));
    let (engine, _) = engine_with(vec![order_accumulator(orders.clone())]);

    let report = engine
        .dispatch(record("orders", 0, r#"{"orderid": 18}"#))
        .await
        .unwrap();

    assert_eq!(report.matched, 1);
    assert!(report.is_clean());
    assert_eq!(*orders.lock().await, vec![18]);
}

#[tokio::test]
async fn test_panicking_sibling_does_not_stop_accumulator() {
    let orders = Arc::new(Mutex::new(Vec::new()));
    let (engine, metrics) = engine_with(vec![
        panicking_agent("orders"),
        order_accumulator(orders.clone()),
    ]);

    let report = engine
        .dispatch(record("orders", 0, r#"{"orderid": 18}"#))
        .await
        .expect("agent failures are reported, not returned as errors");

    assert_eq!(*orders.lock().await, vec![18]);
    assert_eq!(report.matched, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].is_panic());
    assert_eq!(report.failures[0].agent, "panicking");
    assert_eq!(metrics.snapshot().dispatch.agent_panics, 1);
}

#[tokio::test]
async fn test_failing_sibling_is_reported() {
    let recorder = Recorder::new();
    let (engine, _) = engine_with(vec![
        failing_agent("orders", "inventory unavailable"),
        recorder.agent("orders"),
    ]);

    let report = engine
        .dispatch(record("orders", 3, r#"{"orderid": 18}"#))
        .await
        .unwrap();

    assert_eq!(recorder.len().await, 1);
    assert_eq!(report.failures.len(), 1);
    match &report.failures[0].kind {
        AgentFailureKind::Failed(message) => assert!(message.contains("inventory unavailable")),
        other => panic!("unexpected failure kind: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_payload_invokes_nobody() {
    let recorder = Recorder::new();
    let (engine, metrics) = engine_with(vec![recorder.agent("orders")]);

    let result = engine.dispatch(record("orders", 0, "not-json{")).await;

    assert!(result.is_err());
    assert!(recorder.is_empty().await);
    assert_eq!(metrics.snapshot().dispatch.decode_errors, 1);
    assert_eq!(metrics.snapshot().dispatch.agent_invocations, 0);
}

#[tokio::test]
async fn test_unrouted_topic_is_noop() {
    let recorder = Recorder::new();
    let (engine, _) = engine_with(vec![recorder.agent("orders")]);

    let report = engine
        .dispatch(record("payments", 0, r#"{"amount": 5}"#))
        .await
        .unwrap();

    assert!(report.is_noop());
    assert!(recorder.is_empty().await);
}

#[tokio::test]
async fn test_null_payload_still_dispatches() {
    let recorder = Recorder::new();
    let (engine, _) = engine_with(vec![recorder.agent("orders")]);

    engine.dispatch(record("orders", 0, "null")).await.unwrap();

    assert_eq!(recorder.payloads().await, vec![Value::Null]);
}

#[tokio::test]
async fn test_same_agent_registered_five_times_runs_five_times() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let agent = Arc::new(Agent::from_fn(
        "mock-topic",
        PayloadShape::any(),
        move |_payload: Arc<Value>, _ctx: AgentContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        },
    ));

    let registry = Arc::new(AgentRegistry::new());
    for _ in 0..5 {
        registry.register(agent.clone());
    }
    let engine = DispatchEngine::new(registry);

    for offset in 0..10 {
        engine
            .dispatch(record("mock-topic", offset, "{}"))
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn test_agents_for_one_record_run_concurrently() {
    let mut agents = Vec::new();
    for _ in 0..4 {
        agents.push(Agent::from_fn(
            "orders",
            PayloadShape::any(),
            |_payload: Arc<Value>, _ctx: AgentContext| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), HandlerError>(())
            },
        ));
    }
    let (engine, _) = engine_with(agents);

    let report = engine.dispatch(record("orders", 0, "{}")).await.unwrap();

    assert_eq!(report.succeeded, 4);
    assert!(report.elapsed < Duration::from_millis(600));
}

#[tokio::test]
async fn test_handler_timeout_isolates_slow_agent() {
    let recorder = Recorder::new();
    let registry = Arc::new(AgentRegistry::new());
    registry.register(Arc::new(Agent::from_fn(
        "orders",
        PayloadShape::any(),
        |_payload: Arc<Value>, _ctx: AgentContext| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), HandlerError>(())
        },
    )));
    registry.register(Arc::new(recorder.agent("orders")));
    let engine = DispatchEngine::new(registry).with_handler_timeout(Duration::from_millis(50));

    let report = engine.dispatch(record("orders", 0, "{}")).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(report.failures[0].is_timeout());
    assert_eq!(recorder.len().await, 1);
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct Order {
    orderid: i64,
}

#[tokio::test]
async fn test_typed_agent_uses_cache_from_context() {
    let cache: CacheHandle = Arc::new(InMemoryCache::new());
    let registry = Arc::new(AgentRegistry::new());
    registry.register(Arc::new(Agent::typed(
        "orders",
        |order: Order, ctx: AgentContext| async move {
            ctx.cache()?
                .set(&format!("order:{}", order.orderid), "seen".into())
                .await?;
            Ok::<(), HandlerError>(())
        },
    )));
    let engine = DispatchEngine::new(registry).with_cache(cache.clone());

    let ok = engine
        .dispatch(record("orders", 0, r#"{"orderid": 18}"#))
        .await
        .unwrap();
    let wrong_shape = engine
        .dispatch(record("orders", 1, r#"{"order": "18"}"#))
        .await
        .unwrap();

    assert!(ok.is_clean());
    assert_eq!(wrong_shape.failures.len(), 1);
    assert_eq!(
        cache.get("order:18").await.unwrap(),
        Some(bytes::Bytes::from("seen"))
    );
}

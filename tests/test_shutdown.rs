//! Coordinated shutdown tests
//!
//! Concurrent drains, budgets, and a full host run ended through the admin
//! endpoint.

use silk_engine::agent::AgentRegistry;
use silk_engine::broker::InMemoryBroker;
use silk_engine::config::{EngineConfig, ShutdownSection};
use silk_engine::consumer::{ConsumerLifecycle, ConsumerSettings, ConsumerState, StopOutcome};
use silk_engine::dispatch::DispatchEngine;
use silk_engine::shutdown::{ShutdownCoordinator, ShutdownError, ShutdownReason};
use silk_engine::testing::{slow_agent, Recorder, ScriptedDrain};
use silk_engine::App;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

fn budgets(timeout_ms: u64, fault_timeout_ms: u64) -> ShutdownSection {
    ShutdownSection {
        timeout_ms,
        fault_timeout_ms,
        server_grace_ms: 100,
    }
}

#[tokio::test]
async fn test_fast_drain_does_not_wait_for_slow_one() {
    let coordinator = ShutdownCoordinator::new(&budgets(2_000, 500));
    let fast = Arc::new(ScriptedDrain::new("fast", Duration::from_millis(20)));
    let slow = Arc::new(ScriptedDrain::new("slow", Duration::from_millis(400)));
    coordinator.register(fast.clone()).unwrap();
    coordinator.register(slow.clone()).unwrap();

    let started = Instant::now();
    let report = coordinator
        .shutdown(ShutdownReason::Signal("SIGTERM".to_string()))
        .await
        .unwrap();

    assert!(fast.finished_after(started).unwrap() < Duration::from_millis(300));
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(!report.timed_out);
    assert!(report.pending.is_empty());
    assert_eq!(report.outcome_of("fast"), Some(StopOutcome::Drained));
    assert_eq!(report.outcome_of("slow"), Some(StopOutcome::Drained));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_global_budget_bounds_shutdown() {
    let coordinator = ShutdownCoordinator::new(&budgets(200, 100));
    coordinator
        .register(Arc::new(ScriptedDrain::new("fast", Duration::ZERO)))
        .unwrap();
    coordinator
        .register(Arc::new(ScriptedDrain::new("stuck", Duration::from_secs(30))))
        .unwrap();

    let started = Instant::now();
    let report = coordinator
        .shutdown(ShutdownReason::Administrative)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.timed_out);
    assert_eq!(report.pending, vec!["stuck".to_string()]);
    assert_eq!(report.outcome_of("fast"), Some(StopOutcome::Drained));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_fault_uses_shorter_budget_and_exits_nonzero() {
    let coordinator = ShutdownCoordinator::new(&budgets(10_000, 100));
    coordinator
        .register(Arc::new(ScriptedDrain::new("stuck", Duration::from_secs(30))))
        .unwrap();

    let started = Instant::now();
    let report = coordinator
        .shutdown(ShutdownReason::Fault("worker thread died".to_string()))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.pending, vec!["stuck".to_string()]);
}

#[tokio::test]
async fn test_shutdown_runs_once() {
    let coordinator = ShutdownCoordinator::new(&budgets(1_000, 100));
    let drain = Arc::new(ScriptedDrain::new("orders", Duration::ZERO));
    coordinator.register(drain.clone()).unwrap();

    coordinator
        .shutdown(ShutdownReason::Administrative)
        .await
        .unwrap();
    let second = coordinator
        .shutdown(ShutdownReason::Signal("SIGINT".to_string()))
        .await;

    assert!(matches!(second, Err(ShutdownError::InProgress)));
    assert_eq!(drain.calls(), 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_dispatch() {
    let broker = InMemoryBroker::new();
    let registry = Arc::new(AgentRegistry::new());
    let (agent, completed) = slow_agent("payments", Duration::from_millis(300));
    registry.register(Arc::new(agent));
    let engine = DispatchEngine::new(registry);

    let idle = Arc::new(ConsumerLifecycle::new(
        "orders",
        "billing",
        Arc::new(broker.clone()),
        engine.clone(),
        ConsumerSettings::default(),
    ));
    let busy = Arc::new(ConsumerLifecycle::new(
        "payments",
        "billing",
        Arc::new(broker.clone()),
        engine,
        ConsumerSettings::default(),
    ));

    let coordinator = ShutdownCoordinator::new(&budgets(5_000, 500));
    coordinator.register(idle.clone()).unwrap();
    coordinator.register(busy.clone()).unwrap();

    idle.start().await.unwrap();
    busy.start().await.unwrap();
    broker.publish("payments", None, r#"{"amount": 42}"#);

    timeout(Duration::from_secs(2), async {
        while busy.in_flight() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let report = coordinator
        .shutdown(ShutdownReason::Signal("SIGTERM".to_string()))
        .await
        .unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(report.outcome_of("orders"), Some(StopOutcome::Drained));
    assert_eq!(report.outcome_of("payments"), Some(StopOutcome::Drained));
    assert_eq!(idle.state(), ConsumerState::Stopped);
    assert_eq!(busy.state(), ConsumerState::Stopped);
    assert_eq!(broker.committed("billing", "payments", 0), Some(1));
    assert_eq!(broker.members("billing", "payments"), 0);
}

#[tokio::test]
async fn test_app_stops_on_admin_request() {
    let mut config = EngineConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.admin_shutdown = true;
    config.topics = Vec::new();

    let broker = InMemoryBroker::new();
    let app = Arc::new(
        App::builder()
            .config(config)
            .broker(Arc::new(broker.clone()))
            .without_process_hooks()
            .build()
            .unwrap(),
    );
    let recorder = Recorder::new();
    app.register_agent(recorder.agent("orders")).unwrap();
    app.add_consumer("orders").unwrap();

    let runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run().await })
    };

    let orders = app.consumer("orders").unwrap();
    timeout(Duration::from_secs(2), orders.wait_for(ConsumerState::Running))
        .await
        .unwrap();
    broker.publish("orders", None, r#"{"orderid": 18}"#);
    timeout(Duration::from_secs(2), async {
        while recorder.len().await == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let response = warp::test::request()
        .method("POST")
        .path("/shutdown")
        .remote_addr("127.0.0.1:45000".parse().unwrap())
        .reply(&app.health().routes())
        .await;
    assert_eq!(response.status(), 202);

    let report = timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(report.reason, ShutdownReason::Administrative);
    assert_eq!(report.outcome_of("orders"), Some(StopOutcome::Drained));
    assert!(report.server_stopped);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(broker.committed("silk-engine", "orders", 0), Some(1));
}

#[tokio::test]
async fn test_independent_apps_do_not_share_state() {
    let first = App::builder()
        .broker(Arc::new(InMemoryBroker::new()))
        .without_http()
        .without_process_hooks()
        .build()
        .unwrap();
    let second = App::builder()
        .broker(Arc::new(InMemoryBroker::new()))
        .without_http()
        .without_process_hooks()
        .build()
        .unwrap();

    first.register_agent(Recorder::new().agent("orders")).unwrap();
    first.add_consumer("orders").unwrap();

    assert_eq!(first.registry().len(), 1);
    assert!(second.registry().is_empty());
    assert!(second.consumer("orders").is_none());

    first.trigger().fire(ShutdownReason::Administrative);
    assert!(second.trigger().fired().is_none());
}

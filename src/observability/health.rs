//! Health and admin HTTP server
//!
//! Provides probe endpoints for container orchestration, a JSON metrics
//! export, and `POST /shutdown` for administrator-initiated shutdown. The
//! shutdown route is off unless enabled, and then only answers loopback
//! peers.

use crate::consumer::{ConsumerLifecycle, ConsumerState, ConsumerStats};
use crate::observability::metrics::{current_timestamp, MetricsCollector};
use crate::shutdown::{ServerHandle, ShutdownReason, ShutdownTrigger};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::oneshot;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP health server
pub struct HealthServer {
    service: String,
    metrics: Arc<MetricsCollector>,
    trigger: ShutdownTrigger,
    consumers: RwLock<Vec<Arc<ConsumerLifecycle>>>,
    admin_shutdown: bool,
}

impl HealthServer {
    pub fn new(service: &str, metrics: Arc<MetricsCollector>, trigger: ShutdownTrigger) -> Self {
        Self {
            service: service.to_string(),
            metrics,
            trigger,
            consumers: RwLock::new(Vec::new()),
            admin_shutdown: false,
        }
    }

    /// Serve `POST /shutdown` to loopback peers
    pub fn with_admin_shutdown(mut self, enabled: bool) -> Self {
        self.admin_shutdown = enabled;
        self
    }

    /// Include a consumer in health and readiness reporting
    pub fn watch_consumer(&self, consumer: Arc<ConsumerLifecycle>) {
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(consumer);
    }

    fn consumers(&self) -> Vec<Arc<ConsumerLifecycle>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn shutting_down(&self) -> bool {
        self.trigger.fired().is_some()
    }

    pub(crate) fn health_status(&self) -> HealthStatus {
        let consumers: BTreeMap<String, ConsumerHealth> = self
            .consumers()
            .iter()
            .map(|c| {
                (
                    c.topic().to_string(),
                    ConsumerHealth {
                        state: c.state(),
                        in_flight: c.in_flight(),
                        stats: c.stats(),
                    },
                )
            })
            .collect();

        let shutting_down = self.shutting_down();
        let all_running = consumers
            .values()
            .all(|c| c.state == ConsumerState::Running);
        let status = if all_running && !shutting_down {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: current_timestamp(),
            service: self.service.clone(),
            uptime_seconds: self.metrics.snapshot().uptime_seconds,
            shutting_down,
            consumers,
        }
    }

    fn is_ready(&self) -> bool {
        !self.shutting_down()
            && self
                .consumers()
                .iter()
                .all(|c| c.state() == ConsumerState::Running)
    }

    /// All routes, with CORS
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();
        let metrics_server = self.clone();
        let ready_server = self.clone();
        let shutdown_server = self.clone();
        let admin_shutdown = self.admin_shutdown;

        // GET /health - per-consumer status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - JSON snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = metrics_server.clone();
                async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.snapshot())) }
            });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.is_ready();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
                }
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                let response = LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(warp::reply::json(&response))
            });

        // POST /shutdown - administrator-initiated shutdown, loopback only
        let shutdown_route = warp::path("shutdown")
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::addr::remote())
            .and_then(move |remote: Option<SocketAddr>| {
                let server = shutdown_server.clone();
                async move {
                    if !server.admin_shutdown {
                        return Err(warp::reject::not_found());
                    }
                    if !remote.is_some_and(|addr| addr.ip().is_loopback()) {
                        tracing::warn!(remote = ?remote, "Rejected shutdown request from non-loopback peer");
                        let response = ShutdownResponse {
                            accepted: false,
                            reason: server.trigger.fired(),
                            timestamp: current_timestamp(),
                        };
                        return Ok(warp::reply::with_status(
                            warp::reply::json(&response),
                            StatusCode::FORBIDDEN,
                        ));
                    }

                    tracing::info!(remote = ?remote, "Shutdown requested over HTTP");
                    let accepted = server.trigger.fire(ShutdownReason::Administrative);
                    let response = ShutdownResponse {
                        accepted,
                        reason: server.trigger.fired(),
                        timestamp: current_timestamp(),
                    };
                    Ok::<_, Rejection>(warp::reply::with_status(
                        warp::reply::json(&response),
                        StatusCode::ACCEPTED,
                    ))
                }
            });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).and_then(move || async move {
            let mut endpoints = HashMap::new();
            endpoints.insert("/health", "Per-consumer health status");
            endpoints.insert("/metrics", "Dispatch and consumer metrics");
            endpoints.insert("/ready", "Readiness probe");
            endpoints.insert("/live", "Liveness probe");
            if admin_shutdown {
                endpoints.insert("/shutdown", "POST from loopback to start a graceful shutdown");
            }
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse { endpoints }))
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(shutdown_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Bind `addr` and serve until the returned handle is stopped
    pub fn spawn(self: Arc<Self>, addr: SocketAddr) -> Result<ServerHandle, warp::Error> {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (bound, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, async move {
                let _ = stop_rx.await;
            })?;

        tracing::info!(addr = %bound, "Health server listening");
        let task = tokio::spawn(server);
        Ok(ServerHandle::new(bound, stop_tx, task))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ConsumerHealth {
    state: ConsumerState,
    in_flight: usize,
    stats: ConsumerStats,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    uptime_seconds: u64,
    shutting_down: bool,
    consumers: BTreeMap<String, ConsumerHealth>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ShutdownResponse {
    accepted: bool,
    reason: Option<ShutdownReason>,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::broker::InMemoryBroker;
    use crate::consumer::ConsumerSettings;
    use crate::dispatch::DispatchEngine;
    use serde_json::Value;
    use std::time::Duration;

    fn server() -> Arc<HealthServer> {
        Arc::new(HealthServer::new(
            "silk-engine",
            Arc::new(MetricsCollector::new()),
            ShutdownTrigger::new(),
        ))
    }

    fn consumer(broker: &InMemoryBroker) -> Arc<ConsumerLifecycle> {
        Arc::new(ConsumerLifecycle::new(
            "orders",
            "silk-engine",
            Arc::new(broker.clone()),
            DispatchEngine::new(Arc::new(AgentRegistry::new())),
            ConsumerSettings::default(),
        ))
    }

    async fn get(server: &Arc<HealthServer>, path: &str) -> (StatusCode, Value) {
        let response = warp::test::request()
            .method("GET")
            .path(path)
            .reply(&server.routes())
            .await;
        let body = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
        (response.status(), body)
    }

    #[tokio::test]
    async fn test_health_without_consumers_is_healthy() {
        let server = server();
        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "silk-engine");
    }

    #[tokio::test]
    async fn test_health_reports_consumer_states() {
        let server = server();
        let broker = InMemoryBroker::new();
        let orders = consumer(&broker);
        server.watch_consumer(orders.clone());

        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["consumers"]["orders"]["state"], "created");

        orders.start().await.unwrap();
        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["consumers"]["orders"]["state"], "running");

        let (status, _) = get(&server, "/ready").await;
        assert_eq!(status, StatusCode::OK);

        orders.stop().await;
        let (status, body) = get(&server, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn test_live_and_metrics() {
        let server = server();

        let (status, body) = get(&server, "/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["alive"], true);

        let (status, body) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["dispatch"].is_object());
        assert!(body["consumers"].is_object());
    }

    fn admin_server(trigger: &ShutdownTrigger) -> Arc<HealthServer> {
        Arc::new(
            HealthServer::new(
                "silk-engine",
                Arc::new(MetricsCollector::new()),
                trigger.clone(),
            )
            .with_admin_shutdown(true),
        )
    }

    async fn post_shutdown(server: &Arc<HealthServer>, from: &str) -> warp::http::Response<bytes::Bytes> {
        warp::test::request()
            .method("POST")
            .path("/shutdown")
            .remote_addr(from.parse().unwrap())
            .reply(&server.routes())
            .await
    }

    #[tokio::test]
    async fn test_shutdown_route_disabled_by_default() {
        let trigger = ShutdownTrigger::new();
        let server = Arc::new(HealthServer::new(
            "silk-engine",
            Arc::new(MetricsCollector::new()),
            trigger.clone(),
        ));

        let response = post_shutdown(&server, "127.0.0.1:50000").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(trigger.fired().is_none());

        let (_, body) = get(&server, "/").await;
        assert!(body["endpoints"].get("/shutdown").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_route_rejects_remote_peers() {
        let trigger = ShutdownTrigger::new();
        let server = admin_server(&trigger);

        let response = post_shutdown(&server, "203.0.113.7:50000").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(trigger.fired().is_none());

        let unknown_peer = warp::test::request()
            .method("POST")
            .path("/shutdown")
            .reply(&server.routes())
            .await;
        assert_eq!(unknown_peer.status(), StatusCode::FORBIDDEN);
        assert!(trigger.fired().is_none());
    }

    #[tokio::test]
    async fn test_post_shutdown_fires_trigger() {
        let trigger = ShutdownTrigger::new();
        let server = admin_server(&trigger);

        let response = post_shutdown(&server, "127.0.0.1:50000").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(trigger.fired(), Some(ShutdownReason::Administrative));

        let second = post_shutdown(&server, "[::1]:50000").await;
        let body: Value = serde_json::from_slice(second.body()).unwrap();
        assert_eq!(body["accepted"], false);

        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["shutting_down"], true);
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let server = server();
        let handle = server.spawn("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(handle.addr().port(), 0);

        assert!(handle.stop(Duration::from_secs(1)).await);
    }
}

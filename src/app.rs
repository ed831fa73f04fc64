//! Host process context
//!
//! An [`App`] owns everything a running engine needs: the agent registry,
//! the dispatch engine, one [`ConsumerLifecycle`] per topic, the optional
//! cache, the health server and the shutdown coordinator. It is constructed
//! explicitly, so tests can run several independent instances side by side.

use crate::agent::{Agent, AgentRegistry};
use crate::broker::{ConsumerClient, InMemoryBroker, MqttBroker};
use crate::cache::{CacheError, CacheHandle, InMemoryCache, RedisCache};
use crate::config::{BrokerBackend, CacheBackend, ConfigError, EngineConfig};
use crate::consumer::{ConsumerLifecycle, ConsumerSettings, ConsumerState, StopOutcome};
use crate::dispatch::DispatchEngine;
use crate::error::{sanitize_error_message, EngineError, EngineResult};
use crate::observability::{HealthServer, MetricsCollector};
use crate::shutdown::{
    install_panic_hook, spawn_signal_listener, ShutdownCoordinator, ShutdownReason,
    ShutdownReport, ShutdownTrigger,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// What to do when a consumer cannot subscribe during `run`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// Treat the failure as a process fault and shut down
    #[default]
    Abort,
    /// Log it and keep the consumers that did start
    Continue,
}

/// Builder for [`App`]
pub struct AppBuilder {
    config: EngineConfig,
    client: Option<Arc<dyn ConsumerClient>>,
    cache: Option<CacheHandle>,
    policy: StartupPolicy,
    trigger: Option<ShutdownTrigger>,
    serve_http: bool,
    process_hooks: bool,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            client: None,
            cache: None,
            policy: StartupPolicy::default(),
            trigger: None,
            serve_http: true,
            process_hooks: true,
        }
    }
}

impl AppBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker client; defaults to the backend named in the config
    pub fn broker(mut self, client: Arc<dyn ConsumerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Cache handle; defaults to the `[cache]` section, if any
    pub fn cache(mut self, cache: CacheHandle) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn startup_policy(mut self, policy: StartupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn trigger(mut self, trigger: ShutdownTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Do not bind the health/admin HTTP server
    pub fn without_http(mut self) -> Self {
        self.serve_http = false;
        self
    }

    /// Do not install OS signal handlers or the panic hook
    pub fn without_process_hooks(mut self) -> Self {
        self.process_hooks = false;
        self
    }

    pub fn build(self) -> EngineResult<App> {
        let config = self.config;
        config.validate()?;

        let client: Arc<dyn ConsumerClient> = match self.client {
            Some(client) => client,
            None => match config.broker.backend {
                BrokerBackend::Memory => Arc::new(InMemoryBroker::new()),
                BrokerBackend::Mqtt => Arc::new(MqttBroker::new(config.broker.clone())),
            },
        };

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None => cache_from_config(&config)?,
        };

        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(AgentRegistry::new());
        let mut engine = DispatchEngine::new(registry.clone()).with_metrics(metrics.clone());
        if let Some(timeout) = config.consumer.handler_timeout() {
            engine = engine.with_handler_timeout(timeout);
        }
        if let Some(cache) = &cache {
            engine = engine.with_cache(cache.clone());
        }

        let trigger = self.trigger.unwrap_or_default();
        let health = Arc::new(
            HealthServer::new(env!("CARGO_PKG_NAME"), metrics.clone(), trigger.clone())
                .with_admin_shutdown(config.server.admin_shutdown),
        );

        let app = App {
            coordinator: ShutdownCoordinator::new(&config.shutdown),
            settings: ConsumerSettings::from(&config.consumer),
            registry,
            engine,
            client,
            cache,
            metrics,
            trigger,
            health,
            policy: self.policy,
            serve_http: self.serve_http,
            process_hooks: self.process_hooks,
            consumers: RwLock::new(BTreeMap::new()),
            consuming: AtomicBool::new(false),
            config,
        };

        for topic in app.config.topic_names() {
            app.add_consumer(&topic)?;
        }
        Ok(app)
    }
}

fn cache_from_config(config: &EngineConfig) -> EngineResult<Option<CacheHandle>> {
    let Some(section) = &config.cache else {
        return Ok(None);
    };
    let cache: CacheHandle = match section.backend {
        CacheBackend::Memory => Arc::new(InMemoryCache::new()),
        CacheBackend::Redis => {
            let target = section.redis.clone().ok_or_else(|| {
                ConfigError::InvalidConfig("cache.backend = \"redis\" requires cache.redis".to_string())
            })?;
            Arc::new(RedisCache::new(target)?)
        }
    };
    Ok(Some(cache))
}

/// Explicitly constructed engine host
pub struct App {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    engine: DispatchEngine,
    client: Arc<dyn ConsumerClient>,
    cache: Option<CacheHandle>,
    metrics: Arc<MetricsCollector>,
    settings: ConsumerSettings,
    consumers: RwLock<BTreeMap<String, Arc<ConsumerLifecycle>>>,
    coordinator: ShutdownCoordinator,
    trigger: ShutdownTrigger,
    health: Arc<HealthServer>,
    policy: StartupPolicy,
    serve_http: bool,
    process_hooks: bool,
    consuming: AtomicBool,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn health(&self) -> &Arc<HealthServer> {
        &self.health
    }

    /// Handle every shutdown source fires into
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// The cache configured at startup
    pub fn cache(&self) -> Result<&CacheHandle, CacheError> {
        self.cache.as_ref().ok_or(CacheError::NotConfigured)
    }

    /// Add an agent; only allowed before the first consumer starts
    pub fn register_agent(&self, agent: Agent) -> EngineResult<Arc<Agent>> {
        if self.consuming.load(Ordering::SeqCst) {
            return Err(EngineError::RegistrationClosed);
        }
        let agent = Arc::new(agent);
        self.registry.register(agent.clone());
        info!(agent = %agent.label(), topic = %agent.topic(), "Agent registered");
        Ok(agent)
    }

    fn consumers_read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<ConsumerLifecycle>>> {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn consumer(&self, topic: &str) -> Option<Arc<ConsumerLifecycle>> {
        self.consumers_read().get(topic).cloned()
    }

    /// Topics with a consumer, in name order
    pub fn topics(&self) -> Vec<String> {
        self.consumers_read().keys().cloned().collect()
    }

    /// Create (but do not start) the consumer for `topic`; returns the
    /// existing one if already present
    pub fn add_consumer(&self, topic: &str) -> EngineResult<Arc<ConsumerLifecycle>> {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = consumers.get(topic) {
            return Ok(existing.clone());
        }

        let consumer = Arc::new(ConsumerLifecycle::new(
            topic,
            self.config.broker.group_id.clone(),
            self.client.clone(),
            self.engine.clone(),
            self.settings.clone(),
        ));
        self.coordinator.register(consumer.clone())?;
        self.health.watch_consumer(consumer.clone());
        consumers.insert(topic.to_string(), consumer.clone());
        Ok(consumer)
    }

    /// Start consuming `topic`, creating its consumer if needed
    pub async fn start_consumer(&self, topic: &str) -> EngineResult<()> {
        let consumer = match self.consumer(topic) {
            Some(consumer) => consumer,
            None => self.add_consumer(topic)?,
        };
        self.consuming.store(true, Ordering::SeqCst);
        consumer.start().await?;
        Ok(())
    }

    pub async fn stop_consumer(&self, topic: &str) -> EngineResult<StopOutcome> {
        let consumer = self
            .consumer(topic)
            .ok_or_else(|| EngineError::UnknownTopic(topic.to_string()))?;
        Ok(consumer.stop().await)
    }

    /// Start every consumer not yet running, applying the startup policy
    ///
    /// Returns one [`EngineError::Subscription`] per topic that failed to
    /// subscribe.
    pub async fn start_all(&self) -> Vec<EngineError> {
        let pending: Vec<Arc<ConsumerLifecycle>> = self
            .consumers_read()
            .values()
            .filter(|c| matches!(c.state(), ConsumerState::Created | ConsumerState::Stopped))
            .cloned()
            .collect();

        let mut failed = Vec::new();
        for consumer in pending {
            self.consuming.store(true, Ordering::SeqCst);
            if let Err(e) = consumer.start().await {
                let error = EngineError::from_start(e);
                let message = error.log_message();
                if error.is_recoverable() {
                    debug!(topic = %consumer.topic(), error = %message, "Consumer not started");
                    continue;
                }
                failed.push(error);
                match self.policy {
                    StartupPolicy::Abort => {
                        error!(topic = %consumer.topic(), error = %message, "Aborting startup");
                        self.trigger.fire(ShutdownReason::Fault(message));
                        break;
                    }
                    StartupPolicy::Continue => {
                        warn!(topic = %consumer.topic(), error = %message, "Continuing without consumer");
                    }
                }
            }
        }
        failed
    }

    fn listen_addr(&self) -> EngineResult<SocketAddr> {
        let addr = self.config.listen_addr();
        addr.parse().map_err(|_| {
            EngineError::Config(ConfigError::InvalidConfig(format!(
                "server listen address '{addr}' is not a socket address"
            )))
        })
    }

    /// Serve until a shutdown reason arrives, then run the coordinated
    /// shutdown and return its report
    pub async fn run(&self) -> EngineResult<ShutdownReport> {
        if let Some(cache) = &self.cache {
            cache.connect().await?;
            info!(backend = cache.backend(), "Cache connected");
        }

        if self.serve_http {
            let server = self.health.clone().spawn(self.listen_addr()?)?;
            self.coordinator.set_server(server);
        }

        let signals = if self.process_hooks {
            install_panic_hook(self.trigger.clone());
            Some(spawn_signal_listener(self.trigger.clone())?)
        } else {
            None
        };

        let failed = self.start_all().await;
        self.coordinator.seal();
        info!(
            consumers = self.topics().len(),
            failed = failed.len(),
            agents = self.registry.len(),
            "Engine running"
        );

        let reason = self.trigger.wait().await;
        let report = self.coordinator.shutdown(reason).await?;
        for problem in report.errors() {
            if problem.is_recoverable() {
                warn!(error = %problem.log_message(), pending = ?report.pending, "Shutdown incomplete");
            } else {
                error!(error = %problem.log_message(), "Engine stopped by a fault");
            }
        }

        if let Some(signals) = signals {
            signals.close().await;
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.disconnect().await {
                warn!(error = %sanitize_error_message(&e.to_string()), "Cache disconnect failed");
            }
        }

        Ok(report)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("topics", &self.topics())
            .field("agents", &self.registry.len())
            .field("broker", &self.client.backend())
            .field("cache", &self.cache.as_ref().map(|c| c.backend()))
            .finish()
    }
}

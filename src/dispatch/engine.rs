use super::{AgentFailure, AgentFailureKind, DispatchReport};
use crate::agent::{Agent, AgentContext, AgentRegistry};
use crate::cache::CacheHandle;
use crate::dispatch_span;
use crate::error::EngineError;
use crate::message::{decode_payload, DecodeError, MessageEnvelope};
use crate::observability::metrics::{AgentOutcome, MetricsCollector};
use futures::future::join_all;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, warn, Instrument};

tokio::task_local! {
    /// Label of the agent whose handler is running on the current task
    static AGENT_SCOPE: String;
}

/// Whether the caller is running inside an agent handler task
///
/// The process panic hook uses this to tell isolated handler panics apart
/// from process faults.
pub fn in_agent_handler() -> bool {
    AGENT_SCOPE.try_with(|_| ()).is_ok()
}

/// Routes one record to all agents registered on its topic
///
/// Stateless per call: the engine holds only shared, read-mostly handles, so
/// one instance serves every consumer of a host concurrently.
#[derive(Clone)]
pub struct DispatchEngine {
    registry: Arc<AgentRegistry>,
    cache: Option<CacheHandle>,
    metrics: Arc<MetricsCollector>,
    handler_timeout: Option<Duration>,
}

impl DispatchEngine {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            cache: None,
            metrics: Arc::new(MetricsCollector::new()),
            handler_timeout: None,
        }
    }

    /// Cache handle passed to every handler through [`AgentContext`]
    pub fn with_cache(mut self, cache: CacheHandle) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Bound each handler invocation; a zero duration disables the bound
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout
    }

    /// Decode the record and run every matching agent concurrently
    ///
    /// Returns once all matched handlers have finished. Agent failures are
    /// collected into the report; only a payload that is not JSON produces
    /// an `Err`, and in that case no agent runs.
    pub async fn dispatch(&self, envelope: MessageEnvelope) -> Result<DispatchReport, DecodeError> {
        let span = dispatch_span!(
            topic = %envelope.topic(),
            partition = envelope.partition(),
            offset = envelope.offset()
        );
        self.dispatch_record(envelope).instrument(span).await
    }

    async fn dispatch_record(
        &self,
        envelope: MessageEnvelope,
    ) -> Result<DispatchReport, DecodeError> {
        let started = Instant::now();

        let payload = match decode_payload(envelope.payload()) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                self.metrics.decode_error();
                warn!(
                    topic = %envelope.topic(),
                    partition = envelope.partition(),
                    offset = envelope.offset(),
                    key = ?envelope.key_str(),
                    error = %EngineError::from(e.clone()).log_message(),
                    "Dropping record with undecodable payload"
                );
                return Err(e);
            }
        };

        let agents = self.registry.lookup(envelope.topic());
        if agents.is_empty() {
            let elapsed = started.elapsed();
            self.metrics.record_dispatched(0, elapsed);
            debug!(topic = %envelope.topic(), "No agents registered for topic");
            return Ok(DispatchReport {
                position: envelope.position(),
                matched: 0,
                succeeded: 0,
                failures: Vec::new(),
                elapsed,
            });
        }

        let ctx = AgentContext::from_envelope(&envelope, self.cache.clone());
        let handles: Vec<_> = agents
            .iter()
            .map(|agent| self.spawn_agent(agent.clone(), payload.clone(), ctx.clone()))
            .collect();

        let outcomes = join_all(handles).await;

        let mut failures = Vec::new();
        for (agent, outcome) in agents.iter().zip(outcomes) {
            let (result, duration) = match outcome {
                Ok(finished) => finished,
                Err(join_error) => (Err(join_failure(join_error)), started.elapsed()),
            };

            let label = agent.label();
            match result {
                Ok(()) => {
                    self.metrics
                        .agent_executed(&label, duration, AgentOutcome::Succeeded);
                }
                Err(kind) => {
                    self.metrics
                        .agent_executed(&label, duration, outcome_for(&kind));
                    let failure = AgentFailure {
                        agent: label,
                        agent_id: agent.id(),
                        kind,
                    };
                    warn!(
                        topic = %envelope.topic(),
                        partition = envelope.partition(),
                        offset = envelope.offset(),
                        agent = %failure.agent,
                        agent_id = %failure.agent_id,
                        error = %EngineError::from(failure.clone()).log_message(),
                        "Agent failed"
                    );
                    failures.push(failure);
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics.record_dispatched(agents.len(), elapsed);

        Ok(DispatchReport {
            position: envelope.position(),
            matched: agents.len(),
            succeeded: agents.len() - failures.len(),
            failures,
            elapsed,
        })
    }

    /// Run one handler on its own task so a panic stays inside it
    fn spawn_agent(
        &self,
        agent: Arc<Agent>,
        payload: Arc<Value>,
        ctx: AgentContext,
    ) -> tokio::task::JoinHandle<(Result<(), AgentFailureKind>, Duration)> {
        let timeout = self.handler_timeout;
        let label = agent.label();

        let invocation = async move {
            let started = Instant::now();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, agent.execute(payload, ctx)).await
                {
                    Ok(result) => result.map_err(|e| AgentFailureKind::Failed(e.to_string())),
                    Err(_) => Err(AgentFailureKind::TimedOut(limit)),
                },
                None => agent
                    .execute(payload, ctx)
                    .await
                    .map_err(|e| AgentFailureKind::Failed(e.to_string())),
            };
            (result, started.elapsed())
        };

        tokio::spawn(AGENT_SCOPE.scope(label, invocation).in_current_span())
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("registry", &self.registry)
            .field("has_cache", &self.cache.is_some())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

fn outcome_for(kind: &AgentFailureKind) -> AgentOutcome {
    match kind {
        AgentFailureKind::Failed(_) => AgentOutcome::Failed,
        AgentFailureKind::Panicked(_) => AgentOutcome::Panicked,
        AgentFailureKind::TimedOut(_) => AgentOutcome::TimedOut,
    }
}

fn join_failure(error: JoinError) -> AgentFailureKind {
    if error.is_panic() {
        AgentFailureKind::Panicked(panic_message(error.into_panic()))
    } else {
        AgentFailureKind::Failed("handler task was cancelled".to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

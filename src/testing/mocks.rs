//! Handler and drain fixtures
//!
//! Provides recording, failing, panicking and slow agents plus a scriptable
//! [`Drain`] so dispatch, consumer and shutdown behaviour can be exercised
//! without a broker.

use crate::agent::{Agent, AgentContext, HandlerError};
use crate::broker::{BrokerError, ConsumerClient, Subscription};
use crate::consumer::StopOutcome;
use crate::message::PayloadShape;
use crate::shutdown::Drain;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A payload as seen by a recording handler
#[derive(Debug, Clone)]
pub struct Recorded {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Value,
}

/// Accumulates every payload its agents receive
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent on `topic` that appends each payload to this recorder
    pub fn agent(&self, topic: &str) -> Agent {
        let seen = self.seen.clone();
        Agent::from_fn(topic, PayloadShape::any(), move |payload: Arc<Value>, ctx: AgentContext| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(Recorded {
                    topic: ctx.topic().to_string(),
                    partition: ctx.partition(),
                    offset: ctx.offset(),
                    payload: (*payload).clone(),
                });
                Ok::<(), HandlerError>(())
            }
        })
        .with_name("recorder")
    }

    pub async fn payloads(&self) -> Vec<Value> {
        self.seen
            .lock()
            .await
            .iter()
            .map(|r| r.payload.clone())
            .collect()
    }

    pub async fn records(&self) -> Vec<Recorded> {
        self.seen.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.seen.lock().await.clear();
    }
}

/// Agent whose handler always returns an error with `message` as its text
pub fn failing_agent(topic: &str, message: &str) -> Agent {
    let message = message.to_string();
    Agent::from_fn(topic, PayloadShape::any(), move |_payload: Arc<Value>, _ctx: AgentContext| {
        let message = message.clone();
        async move { Err::<(), HandlerError>(message.into()) }
    })
    .with_name("failing")
}

async fn explode(_payload: Arc<Value>, _ctx: AgentContext) -> Result<(), HandlerError> {
    panic!("handler panicked on purpose")
}

/// Agent whose handler panics
pub fn panicking_agent(topic: &str) -> Agent {
    Agent::from_fn(topic, PayloadShape::any(), explode).with_name("panicking")
}

/// Agent that sleeps for `delay`; the counter increments when it finishes
pub fn slow_agent(topic: &str, delay: Duration) -> (Agent, Arc<AtomicUsize>) {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let agent = Agent::from_fn(topic, PayloadShape::any(), move |_payload: Arc<Value>, _ctx: AgentContext| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(delay).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    })
    .with_name("slow");
    (agent, completed)
}

/// Drain with a scripted delay and outcome
#[derive(Debug)]
pub struct ScriptedDrain {
    name: String,
    delay: Duration,
    outcome: StopOutcome,
    calls: AtomicUsize,
    finished: StdMutex<Option<Instant>>,
}

impl ScriptedDrain {
    /// Drains successfully after `delay`
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
            outcome: StopOutcome::Drained,
            calls: AtomicUsize::new(0),
            finished: StdMutex::new(None),
        }
    }

    /// Reports a drain timeout with `in_flight` dispatches left
    pub fn timing_out(name: &str, in_flight: usize) -> Self {
        Self {
            outcome: StopOutcome::TimedOut { in_flight },
            ..Self::new(name, Duration::ZERO)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time from `start` until the drain finished, if it has
    pub fn finished_after(&self, start: Instant) -> Option<Duration> {
        let finished = *self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        finished.map(|at| at.saturating_duration_since(start))
    }
}

#[async_trait]
impl Drain for ScriptedDrain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn drain(&self) -> StopOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.outcome
    }
}

/// Broker client that refuses every subscription
#[derive(Debug, Clone)]
pub struct UnreachableBroker {
    reason: String,
}

impl UnreachableBroker {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ConsumerClient for UnreachableBroker {
    fn backend(&self) -> &'static str {
        "unreachable"
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        Err(BrokerError::Unreachable(self.reason.clone()))
    }
}

use super::{
    CommitTracker, ConsumerError, ConsumerSettings, ConsumerState, ConsumerStats, StopOutcome,
};
use crate::broker::{BrokerRecord, ConsumerClient, Subscription};
use crate::consumer_span;
use crate::dispatch::{DispatchEngine, DispatchReport};
use crate::error::sanitize_error_message;
use crate::message::{DecodeError, RecordPosition};
use crate::shutdown::Drain;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// How long a timed-out stop waits for the loop to leave the group
const LEAVE_WAIT: Duration = Duration::from_secs(5);

/// Instruction from the lifecycle handle to its loop task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    /// Stop pulling and drain
    Stop,
    /// Leave the group now, even with dispatches still running
    Leave,
}

#[derive(Debug, Default)]
struct Counters {
    records: AtomicU64,
    decode_errors: AtomicU64,
    agent_failures: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            records: self.records.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            agent_failures: self.agent_failures.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the lifecycle handle and its loop task
struct Shared {
    topic: String,
    group_id: String,
    engine: DispatchEngine,
    state: watch::Sender<ConsumerState>,
    /// True while the loop holds a group membership
    member: watch::Sender<bool>,
    in_flight: AtomicUsize,
    counters: Counters,
}

impl Shared {
    /// Move to `to` unless already there; returns whether the state changed
    fn transition(&self, to: ConsumerState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == to {
                false
            } else {
                debug!(topic = %self.topic, from = %state, to = %to, "Consumer state change");
                *state = to;
                true
            }
        })
    }

    fn mark_stopped(&self) {
        if self.transition(ConsumerState::Stopped) {
            self.engine.metrics().consumer_stopped();
        }
    }

    fn record_outcome(&self, outcome: &Result<DispatchReport, DecodeError>) {
        match outcome {
            Ok(report) => {
                self.counters
                    .agent_failures
                    .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn commit(&self, subscription: &mut dyn Subscription, position: &RecordPosition) {
        match subscription.commit(position).await {
            Ok(()) => {
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                self.engine.metrics().record_committed();
            }
            Err(e) => {
                self.counters.commit_failures.fetch_add(1, Ordering::Relaxed);
                self.engine.metrics().commit_failed();
                warn!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    error = %sanitize_error_message(&e.to_string()),
                    "Offset commit failed"
                );
            }
        }
    }
}

#[derive(Default)]
struct Control {
    signal: Option<watch::Sender<Signal>>,
    task: Option<JoinHandle<()>>,
}

/// Owns one consumer-group subscription and its consumption loop
///
/// `start` subscribes and spawns the loop; `stop` stops pulling, waits for
/// in-flight dispatches within the drain budget, commits and leaves the
/// group. Handlers that are already running are never cancelled: when the
/// budget runs out the group is left anyway and their offsets stay
/// uncommitted.
pub struct ConsumerLifecycle {
    shared: Arc<Shared>,
    client: Arc<dyn ConsumerClient>,
    settings: ConsumerSettings,
    control: Mutex<Control>,
}

impl ConsumerLifecycle {
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        client: Arc<dyn ConsumerClient>,
        engine: DispatchEngine,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Created);
        let (member, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                group_id: group_id.into(),
                engine,
                state,
                member,
                in_flight: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
            client,
            settings,
            control: Mutex::new(Control::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.shared.state.subscribe()
    }

    /// Resolve once the consumer reaches `target`
    pub async fn wait_for(&self, target: ConsumerState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Dispatches started but not yet finished
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.shared.counters.snapshot()
    }

    /// Whether the consumer currently holds its group membership
    pub fn is_member(&self) -> bool {
        *self.shared.member.borrow()
    }

    /// Subscribe and begin consuming
    ///
    /// Valid from `Created` and from `Stopped` once the previous loop has
    /// finished. A subscription failure leaves the state unchanged.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let mut control = self.control.lock().await;

        let state = self.state();
        let previous_running = control.task.as_ref().is_some_and(|t| !t.is_finished());
        if matches!(state, ConsumerState::Running | ConsumerState::Draining) || previous_running {
            return Err(ConsumerError::InvalidState {
                topic: self.shared.topic.clone(),
                operation: "start",
                state,
            });
        }

        let subscription = match self
            .client
            .subscribe(&self.shared.topic, &self.shared.group_id)
            .await
        {
            Ok(subscription) => subscription,
            Err(source) => {
                self.shared.engine.metrics().subscription_failed();
                error!(
                    topic = %self.shared.topic,
                    group = %self.shared.group_id,
                    backend = self.client.backend(),
                    error = %sanitize_error_message(&source.to_string()),
                    "Subscription failed"
                );
                return Err(ConsumerError::Subscription {
                    topic: self.shared.topic.clone(),
                    source,
                });
            }
        };

        let (signal_tx, signal_rx) = watch::channel(Signal::Run);
        self.shared.member.send_replace(true);
        self.shared.transition(ConsumerState::Running);
        self.shared.engine.metrics().consumer_started();

        let span = consumer_span!(
            topic = %self.shared.topic,
            group = %self.shared.group_id,
            ordered = self.settings.ordered
        );
        let consumption = ConsumptionLoop {
            shared: self.shared.clone(),
            subscription,
            signal: signal_rx,
            settings: self.settings.clone(),
            left: false,
        };
        control.signal = Some(signal_tx);
        control.task = Some(tokio::spawn(consumption.run().instrument(span)));

        info!(
            topic = %self.shared.topic,
            group = %self.shared.group_id,
            backend = self.client.backend(),
            "Consumer started"
        );
        Ok(())
    }

    /// Stop pulling, drain in-flight work and leave the group
    ///
    /// Idempotent: a consumer that never started or has already stopped
    /// returns immediately. Concurrent callers wait for the first drain.
    pub async fn stop(&self) -> StopOutcome {
        let mut control = self.control.lock().await;

        match self.state() {
            ConsumerState::Created => return StopOutcome::NotStarted,
            ConsumerState::Stopped => return StopOutcome::AlreadyStopped,
            ConsumerState::Running | ConsumerState::Draining => {}
        }

        self.shared.transition(ConsumerState::Draining);
        info!(
            topic = %self.shared.topic,
            in_flight = self.in_flight(),
            "Consumer draining"
        );
        // The sender stays alive while draining: dropping it means "leave"
        let signal = control.signal.take();
        if let Some(signal) = &signal {
            signal.send_replace(Signal::Stop);
        }

        let Some(mut task) = control.task.take() else {
            self.shared.mark_stopped();
            return StopOutcome::Drained;
        };

        match tokio::time::timeout(self.settings.drain_timeout, &mut task).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    error!(topic = %self.shared.topic, error = %e, "Consumption loop ended abnormally");
                    self.shared.member.send_replace(false);
                }
                self.shared.mark_stopped();
                info!(topic = %self.shared.topic, "Consumer stopped");
                StopOutcome::Drained
            }
            Err(_) => {
                let in_flight = self.in_flight();
                self.shared.engine.metrics().drain_timed_out();
                warn!(
                    topic = %self.shared.topic,
                    in_flight,
                    timeout_ms = self.settings.drain_timeout.as_millis() as u64,
                    "Drain timed out; leaving the group with dispatches still running"
                );
                if let Some(signal) = &signal {
                    signal.send_replace(Signal::Leave);
                }
                self.await_left().await;
                self.shared.mark_stopped();
                // The loop keeps running detached until its handlers finish
                control.task = Some(task);
                StopOutcome::TimedOut { in_flight }
            }
        }
    }

    async fn await_left(&self) {
        let mut member = self.shared.member.subscribe();
        let left = tokio::time::timeout(LEAVE_WAIT, member.wait_for(|member| !*member)).await;
        if left.is_err() {
            error!(
                topic = %self.shared.topic,
                group = %self.shared.group_id,
                "Consumer did not leave its group in time"
            );
        }
    }
}

impl std::fmt::Debug for ConsumerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLifecycle")
            .field("topic", &self.shared.topic)
            .field("group_id", &self.shared.group_id)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[async_trait]
impl Drain for ConsumerLifecycle {
    fn name(&self) -> &str {
        &self.shared.topic
    }

    async fn drain(&self) -> StopOutcome {
        self.stop().await
    }
}

/// Decrements the in-flight gauge when a dispatch ends, even by panic
struct InFlightGuard(Arc<Shared>);

impl InFlightGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(shared.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves once stop is requested or the lifecycle handle is gone
async fn stop_requested(signal: &mut watch::Receiver<Signal>) {
    let _ = signal.wait_for(|signal| *signal != Signal::Run).await;
}

/// Resolves once an immediate leave is requested or the handle is gone
async fn leave_requested(signal: &mut watch::Receiver<Signal>) {
    let _ = signal.wait_for(|signal| *signal == Signal::Leave).await;
}

enum Pulled {
    Record(BrokerRecord),
    Stop,
    Ended,
}

struct ConsumptionLoop {
    shared: Arc<Shared>,
    subscription: Box<dyn Subscription>,
    signal: watch::Receiver<Signal>,
    settings: ConsumerSettings,
    left: bool,
}

impl ConsumptionLoop {
    async fn run(mut self) {
        if self.settings.ordered {
            self.run_ordered().await;
        } else {
            self.run_unordered().await;
        }

        self.leave().await;
        self.shared.mark_stopped();
        debug!(topic = %self.shared.topic, "Consumption loop finished");
    }

    async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        if let Err(e) = self.subscription.leave().await {
            warn!(
                topic = %self.shared.topic,
                error = %sanitize_error_message(&e.to_string()),
                "Leaving consumer group failed"
            );
        }
        self.shared.member.send_replace(false);
        info!(topic = %self.shared.topic, group = %self.shared.group_id, "Left consumer group");
    }

    /// Offsets finished after leaving are not ours to commit any more
    async fn commit(&mut self, position: &RecordPosition) {
        if self.left {
            warn!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                "Dispatch finished after leaving the group; offset not committed"
            );
            return;
        }
        self.shared.commit(self.subscription.as_mut(), position).await;
    }

    async fn pull(&mut self) -> Pulled {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut self.signal) => return Pulled::Stop,
            next = self.subscription.next_record() => next,
        };

        match next {
            Ok(Some(record)) => {
                self.shared.counters.records.fetch_add(1, Ordering::Relaxed);
                self.shared.engine.metrics().record_received();
                Pulled::Record(record)
            }
            Ok(None) => {
                info!(topic = %self.shared.topic, "Subscription stream ended");
                Pulled::Ended
            }
            Err(e) => {
                error!(
                    topic = %self.shared.topic,
                    error = %sanitize_error_message(&e.to_string()),
                    "Subscription failed while consuming"
                );
                Pulled::Ended
            }
        }
    }

    /// One record at a time: dispatch, commit, pull the next
    async fn run_ordered(&mut self) {
        loop {
            let record = match self.pull().await {
                Pulled::Record(record) => record,
                Pulled::Stop => break,
                Pulled::Ended => {
                    self.shared.transition(ConsumerState::Draining);
                    break;
                }
            };

            let position = record.position();
            let engine = self.shared.engine.clone();
            let outcome = {
                let _guard = InFlightGuard::enter(&self.shared);
                let dispatch = engine.dispatch(record.into_envelope());
                tokio::pin!(dispatch);
                loop {
                    tokio::select! {
                        outcome = &mut dispatch => break outcome,
                        _ = leave_requested(&mut self.signal), if !self.left => {}
                    }
                    self.leave().await;
                }
            };
            self.shared.record_outcome(&outcome);
            self.commit(&position).await;
        }
    }

    /// Up to `max_in_flight` dispatches at once; commits follow the lowest
    /// unfinished offset of each partition
    async fn run_unordered(&mut self) {
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let mut tracker = CommitTracker::new(self.shared.topic.clone());
        let mut tasks: JoinSet<(i32, i64, Result<DispatchReport, DecodeError>)> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop_requested(&mut self.signal) => break,
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    self.finish(&mut tracker, done).await;
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let record = tokio::select! {
                biased;
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    drop(permit);
                    self.finish(&mut tracker, done).await;
                    continue;
                }
                pulled = self.pull() => match pulled {
                    Pulled::Record(record) => record,
                    Pulled::Stop => break,
                    Pulled::Ended => {
                        self.shared.transition(ConsumerState::Draining);
                        break;
                    }
                },
            };

            let (partition, offset) = (record.partition, record.offset);
            tracker.begin(partition, offset);

            let engine = self.shared.engine.clone();
            let guard = InFlightGuard::enter(&self.shared);
            tasks.spawn(
                async move {
                    let _guard = guard;
                    let _permit = permit;
                    let outcome = engine.dispatch(record.into_envelope()).await;
                    (partition, offset, outcome)
                }
                .in_current_span(),
            );
        }

        debug!(topic = %self.shared.topic, pending = tracker.pending(), "Draining in-flight dispatches");
        while !tasks.is_empty() {
            tokio::select! {
                Some(done) = tasks.join_next() => self.finish(&mut tracker, done).await,
                _ = leave_requested(&mut self.signal), if !self.left => self.leave().await,
            }
        }
    }

    async fn finish(
        &mut self,
        tracker: &mut CommitTracker,
        done: Result<(i32, i64, Result<DispatchReport, DecodeError>), tokio::task::JoinError>,
    ) {
        match done {
            Ok((partition, offset, outcome)) => {
                self.shared.record_outcome(&outcome);
                if let Some(position) = tracker.complete(partition, offset) {
                    self.commit(&position).await;
                }
            }
            // Dispatch isolates handler panics, so this is an engine bug
            Err(e) => error!(topic = %self.shared.topic, error = %e, "Dispatch task failed"),
        }
    }
}

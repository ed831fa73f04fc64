//! Thread-safe metrics collection
//!
//! Atomic counters for the per-record hot path, mutex-protected collections
//! for latency samples and per-agent statistics. One collector belongs to one
//! `App`; nothing here is process-global.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Collector shared by the dispatch engine and every consumer of one host
pub struct MetricsCollector {
    // Dispatch (atomic, hot path)
    records_dispatched: AtomicU64,
    records_unrouted: AtomicU64,
    decode_errors: AtomicU64,
    agent_invocations: AtomicU64,
    agent_failures: AtomicU64,
    agent_panics: AtomicU64,
    agent_timeouts: AtomicU64,

    // Consumption
    records_received: AtomicU64,
    records_committed: AtomicU64,
    commit_failures: AtomicU64,
    consumers_running: AtomicU64,
    subscription_failures: AtomicU64,
    drain_timeouts: AtomicU64,

    dispatch_times: Mutex<Vec<u64>>, // microseconds
    agent_stats: Mutex<HashMap<String, AgentExecutionStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            records_dispatched: AtomicU64::new(0),
            records_unrouted: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            agent_invocations: AtomicU64::new(0),
            agent_failures: AtomicU64::new(0),
            agent_panics: AtomicU64::new(0),
            agent_timeouts: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
            records_committed: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            consumers_running: AtomicU64::new(0),
            subscription_failures: AtomicU64::new(0),
            drain_timeouts: AtomicU64::new(0),
            dispatch_times: Mutex::new(Vec::new()),
            agent_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Dispatch metrics
    pub fn record_dispatched(&self, matched: usize, elapsed: Duration) {
        self.records_dispatched.fetch_add(1, Ordering::Relaxed);
        if matched == 0 {
            self.records_unrouted.fetch_add(1, Ordering::Relaxed);
        }

        let mut times = self
            .dispatch_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        times.push(elapsed.as_micros() as u64);
        if times.len() > MAX_LATENCY_SAMPLES {
            let excess = times.len() - MAX_LATENCY_SAMPLES;
            times.drain(0..excess);
        }
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one agent invocation and its outcome
    pub fn agent_executed(&self, agent: &str, duration: Duration, outcome: AgentOutcome) {
        self.agent_invocations.fetch_add(1, Ordering::Relaxed);
        match outcome {
            AgentOutcome::Succeeded => {}
            AgentOutcome::Failed => {
                self.agent_failures.fetch_add(1, Ordering::Relaxed);
            }
            AgentOutcome::Panicked => {
                self.agent_failures.fetch_add(1, Ordering::Relaxed);
                self.agent_panics.fetch_add(1, Ordering::Relaxed);
            }
            AgentOutcome::TimedOut => {
                self.agent_failures.fetch_add(1, Ordering::Relaxed);
                self.agent_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut stats = self
            .agent_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = stats
            .entry(agent.to_string())
            .or_insert_with(|| AgentExecutionStats::new(agent));
        entry.invocations += 1;
        if outcome != AgentOutcome::Succeeded {
            entry.failures += 1;
        }
        entry.execution_times.push(duration.as_millis() as u64);
        if entry.execution_times.len() > MAX_LATENCY_SAMPLES {
            entry.execution_times.remove(0);
        }
        entry.last_execution = current_timestamp();
    }

    // Consumption metrics
    pub fn record_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_committed(&self) {
        self.records_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_failed(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_started(&self) {
        self.consumers_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_stopped(&self) {
        // Saturating: a consumer whose loop ends on its own and is later
        // stopped must not wrap the gauge.
        let _ = self
            .consumers_running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn subscription_failed(&self) {
        self.subscription_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drain_timed_out(&self) {
        self.drain_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset every counter and collection
    pub fn reset(&self) {
        for counter in [
            &self.records_dispatched,
            &self.records_unrouted,
            &self.decode_errors,
            &self.agent_invocations,
            &self.agent_failures,
            &self.agent_panics,
            &self.agent_timeouts,
            &self.records_received,
            &self.records_committed,
            &self.commit_failures,
            &self.consumers_running,
            &self.subscription_failures,
            &self.drain_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        self.dispatch_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.agent_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    fn dispatch_latency(&self) -> (f64, f64, f64, f64) {
        let mut times = self
            .dispatch_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        times.sort_unstable();
        let avg = times.iter().sum::<u64>() as f64 / times.len() as f64;
        (
            avg,
            percentile(&times, 50.0),
            percentile(&times, 95.0),
            percentile(&times, 99.0),
        )
    }

    fn agent_snapshots(&self) -> HashMap<String, AgentStatsSnapshot> {
        let stats = self
            .agent_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        stats
            .iter()
            .map(|(name, s)| {
                let avg = if s.execution_times.is_empty() {
                    0.0
                } else {
                    s.execution_times.iter().sum::<u64>() as f64 / s.execution_times.len() as f64
                };
                let success_rate = if s.invocations == 0 {
                    1.0
                } else {
                    (s.invocations - s.failures) as f64 / s.invocations as f64
                };
                (
                    name.clone(),
                    AgentStatsSnapshot {
                        name: s.name.clone(),
                        invocations: s.invocations,
                        failures: s.failures,
                        avg_execution_time_ms: avg,
                        last_execution: s.last_execution,
                        success_rate,
                    },
                )
            })
            .collect()
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.dispatch_latency();

        MetricsSnapshot {
            dispatch: DispatchMetrics {
                records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
                records_unrouted: self.records_unrouted.load(Ordering::Relaxed),
                decode_errors: self.decode_errors.load(Ordering::Relaxed),
                agent_invocations: self.agent_invocations.load(Ordering::Relaxed),
                agent_failures: self.agent_failures.load(Ordering::Relaxed),
                agent_panics: self.agent_panics.load(Ordering::Relaxed),
                agent_timeouts: self.agent_timeouts.load(Ordering::Relaxed),
                avg_dispatch_time_us: avg,
                dispatch_time_p50_us: p50,
                dispatch_time_p95_us: p95,
                dispatch_time_p99_us: p99,
            },
            consumers: ConsumerMetrics {
                records_received: self.records_received.load(Ordering::Relaxed),
                records_committed: self.records_committed.load(Ordering::Relaxed),
                commit_failures: self.commit_failures.load(Ordering::Relaxed),
                consumers_running: self.consumers_running.load(Ordering::Relaxed),
                subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
                drain_timeouts: self.drain_timeouts.load(Ordering::Relaxed),
            },
            agents: self.agent_snapshots(),
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// How one agent invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    Succeeded,
    Failed,
    Panicked,
    TimedOut,
}

#[derive(Debug)]
struct AgentExecutionStats {
    name: String,
    invocations: u64,
    failures: u64,
    execution_times: Vec<u64>, // milliseconds
    last_execution: u64,
}

impl AgentExecutionStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            invocations: 0,
            failures: 0,
            execution_times: Vec::new(),
            last_execution: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub dispatch: DispatchMetrics,
    pub consumers: ConsumerMetrics,
    pub agents: HashMap<String, AgentStatsSnapshot>,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub records_dispatched: u64,
    pub records_unrouted: u64,
    pub decode_errors: u64,
    pub agent_invocations: u64,
    pub agent_failures: u64,
    pub agent_panics: u64,
    pub agent_timeouts: u64,
    pub avg_dispatch_time_us: f64,
    pub dispatch_time_p50_us: f64,
    pub dispatch_time_p95_us: f64,
    pub dispatch_time_p99_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerMetrics {
    pub records_received: u64,
    pub records_committed: u64,
    pub commit_failures: u64,
    pub consumers_running: u64,
    pub subscription_failures: u64,
    pub drain_timeouts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatsSnapshot {
    pub name: String,
    pub invocations: u64,
    pub failures: u64,
    pub avg_execution_time_ms: f64,
    pub last_execution: u64,
    pub success_rate: f64,
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

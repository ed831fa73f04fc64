use super::{Drain, ShutdownError, ShutdownReason, ShutdownReport};
use crate::config::ShutdownSection;
use crate::consumer::StopOutcome;
use crate::shutdown_span;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Running HTTP server that stops accepting connections on request
pub struct ServerHandle {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn new(addr: SocketAddr, stop: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self { addr, stop, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting; in-flight requests get `grace` to finish
    pub async fn stop(self, grace: Duration) -> bool {
        let _ = self.stop.send(());
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(addr = %self.addr, grace_ms = grace.as_millis() as u64, "HTTP server did not finish in time; aborting");
                task.abort();
                false
            }
        }
    }
}

/// Fans one shutdown out to every registered drain
///
/// Drains are registered during startup; `seal` closes registration once
/// the host starts serving. `shutdown` runs at most once per coordinator.
pub struct ShutdownCoordinator {
    drains: Mutex<Vec<Arc<dyn Drain>>>,
    server: Mutex<Option<ServerHandle>>,
    sealed: AtomicBool,
    started: AtomicBool,
    timeout: Duration,
    fault_timeout: Duration,
    server_grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(settings: &ShutdownSection) -> Self {
        Self {
            drains: Mutex::new(Vec::new()),
            server: Mutex::new(None),
            sealed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            timeout: settings.timeout(),
            fault_timeout: settings.fault_timeout(),
            server_grace: settings.server_grace(),
        }
    }

    fn drains(&self) -> MutexGuard<'_, Vec<Arc<dyn Drain>>> {
        self.drains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn server(&self) -> MutexGuard<'_, Option<ServerHandle>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, drain: Arc<dyn Drain>) -> Result<(), ShutdownError> {
        if self.is_sealed() {
            return Err(ShutdownError::Sealed);
        }
        self.drains().push(drain);
        Ok(())
    }

    /// HTTP server to stop after the drains
    pub fn set_server(&self, server: ServerHandle) {
        if let Some(previous) = self.server().replace(server) {
            previous.task.abort();
        }
    }

    /// Close registration
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> Vec<String> {
        self.drains().iter().map(|d| d.name().to_string()).collect()
    }

    /// Budget for the drain phase given why we are stopping
    pub fn budget_for(&self, reason: &ShutdownReason) -> Duration {
        if reason.is_fault() {
            self.fault_timeout
        } else {
            self.timeout
        }
    }

    /// Run the shutdown sequence once
    ///
    /// Every drain is stopped concurrently. The call returns when all of them
    /// have reported or the budget for `reason` elapses; drains still running
    /// at that point are listed as pending and left to finish on their own.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Result<ShutdownReport, ShutdownError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(reason = %reason, "Shutdown already in progress");
            return Err(ShutdownError::InProgress);
        }
        self.seal();

        let span = shutdown_span!(reason = %reason);
        Ok(self.run_sequence(reason).instrument(span).await)
    }

    async fn run_sequence(&self, reason: ShutdownReason) -> ShutdownReport {
        let started = Instant::now();
        let budget = self.budget_for(&reason);
        let drains: Vec<Arc<dyn Drain>> = self.drains().clone();

        info!(
            phase = "shutdown.begin",
            reason = %reason,
            consumers = drains.len(),
            budget_ms = budget.as_millis() as u64,
            "Shutdown sequence started"
        );

        let (consumers, pending) = drain_all(drains, budget).await;
        let drain_timed_out = consumers.iter().any(|(_, o)| o.is_timeout());
        info!(
            phase = "shutdown.consumers",
            stopped = consumers.len(),
            pending = pending.len(),
            timed_out = drain_timed_out,
            "Consumers stopped"
        );
        if !pending.is_empty() {
            warn!(pending = ?pending, "Shutdown budget elapsed before every consumer stopped");
        }

        let server = self.server().take();
        let server_stopped = match server {
            Some(server) => server.stop(self.server_grace).await,
            None => true,
        };
        info!(phase = "shutdown.server", stopped = server_stopped, "HTTP server stopped");

        let report = ShutdownReport {
            reason,
            timed_out: drain_timed_out || !pending.is_empty(),
            consumers,
            pending,
            server_stopped,
            elapsed: started.elapsed(),
        };

        info!(
            phase = "shutdown.complete",
            exit_code = report.exit_code(),
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown sequence complete"
        );
        report
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("drains", &self.registered())
            .field("sealed", &self.is_sealed())
            .field("started", &self.is_shutting_down())
            .finish()
    }
}

/// Stop every drain on its own task and collect outcomes until `budget`
async fn drain_all(
    drains: Vec<Arc<dyn Drain>>,
    budget: Duration,
) -> (Vec<(String, StopOutcome)>, Vec<String>) {
    let mut pending: Vec<String> = drains.iter().map(|d| d.name().to_string()).collect();
    let mut running: FuturesUnordered<_> = drains
        .into_iter()
        .map(|drain| {
            let name = drain.name().to_string();
            let task = tokio::spawn(async move { drain.drain().await }.in_current_span());
            async move { (name, task.await) }
        })
        .collect();

    let deadline = tokio::time::Instant::now() + budget;
    let mut finished = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, running.next()).await {
            Ok(Some((name, joined))) => {
                if let Some(index) = pending.iter().position(|n| *n == name) {
                    pending.swap_remove(index);
                }
                match joined {
                    Ok(outcome) => finished.push((name, outcome)),
                    Err(e) => error!(consumer = %name, error = %e, "Drain task failed"),
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    (finished, pending)
}

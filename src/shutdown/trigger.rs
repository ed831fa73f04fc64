//! Shutdown sources feeding one trigger

use super::ShutdownReason;
use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::{Handle, Signals};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cloneable handle that records the first shutdown reason
///
/// Later reasons are logged and ignored, so every source can fire freely
/// without racing the others into a second shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    reason: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            reason: Arc::new(reason),
        }
    }

    /// Request shutdown; returns false if a reason was already recorded
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        let accepted = self.reason.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason.clone());
                true
            }
        });

        if accepted {
            info!(reason = %reason, "Shutdown requested");
        } else {
            warn!(reason = %reason, "Shutdown already requested; ignoring");
        }
        accepted
    }

    /// The recorded reason, if any
    pub fn fired(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    /// Resolve with the first reason
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.reason.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::Administrative;
            }
        }
    }
}

/// Turn panics outside agent handlers into a fault shutdown
///
/// Handler panics are already isolated by the dispatch engine and only
/// fail that one invocation. The previously installed hook still runs.
pub fn install_panic_hook(trigger: ShutdownTrigger) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        if crate::dispatch::in_agent_handler() {
            return;
        }
        error!(panic = %info, "Unhandled panic; starting fault shutdown");
        trigger.fire(ShutdownReason::Fault(info.to_string()));
    }));
}

/// Background task forwarding SIGINT and SIGTERM into a trigger
pub struct SignalListener {
    handle: Handle,
    task: JoinHandle<()>,
}

impl SignalListener {
    /// Stop listening and wait for the task to exit
    pub async fn close(self) {
        self.handle.close();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Signal listener ended abnormally");
        }
    }
}

pub fn spawn_signal_listener(trigger: ShutdownTrigger) -> std::io::Result<SignalListener> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();

    let task = tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            let name = match signal {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                _ => "unknown",
            };
            info!(signal = name, "Received termination signal");
            trigger.fire(ShutdownReason::Signal(name.to_string()));
        }
    });

    Ok(SignalListener { handle, task })
}

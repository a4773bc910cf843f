//! Heartbeat Monitor
//!
//! While connected, re-runs the healthcheck RPC on a fixed interval. The
//! first failure demotes the connection to `Error` with `heartbeat_failed`
//! and ends the loop; the reconnect supervisor picks it up from the status
//! change.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::manager::ConnectionManager;
use crate::core::lock;
use crate::core::status::ConnectionStatus;

struct Running {
    handle: JoinHandle<()>,
    stop_tx: broadcast::Sender<()>,
}

/// Periodic healthcheck loop bound to one [`ConnectionManager`].
pub struct HeartbeatMonitor {
    manager: Arc<ConnectionManager>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    pub fn new(manager: Arc<ConnectionManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Interval between checks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the loop. No-op unless connected and not already running.
    pub fn start(&self) -> bool {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        if !self.manager.is_connected() {
            debug!("not starting heartbeat while {}", self.manager.status());
            return false;
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(beat(self.manager.clone(), self.interval, stop_rx));
        *running = Some(Running { handle, stop_tx });
        debug!(interval_ms = self.interval.as_millis() as u64, "heartbeat started");
        true
    }

    /// Stop the loop. Takes effect immediately.
    pub fn stop(&self) {
        if let Some(running) = lock(&self.running).take() {
            let _ = running.stop_tx.send(());
            running.handle.abort();
            debug!("heartbeat stopped");
        }
    }

    /// Whether a loop is alive.
    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn beat(manager: Arc<ConnectionManager>, interval: Duration, mut stop_rx: broadcast::Receiver<()>) {
    loop {
        if manager.status() != ConnectionStatus::Connected {
            break;
        }

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        // Status may have changed while sleeping.
        if manager.status() != ConnectionStatus::Connected {
            break;
        }

        let outcome = tokio::select! {
            _ = stop_rx.recv() => break,
            outcome = manager.healthcheck() => outcome,
        };

        match outcome {
            Ok(()) => trace!("heartbeat ok"),
            Err(err) => {
                warn!("heartbeat failed: {}", err);
                manager.report_heartbeat_failure();
                break;
            }
        }
    }
    debug!("heartbeat loop finished");
}

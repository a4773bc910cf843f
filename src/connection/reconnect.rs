//! Reconnect Supervisor
//!
//! Re-establishes a dropped connection on a bounded backoff schedule. Each
//! attempt sleeps, checks whether someone else already reconnected, then
//! runs a full disconnect and connect. At most one loop exists at a time.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::manager::ConnectionManager;
use crate::core::lock;
use crate::core::status::ConnectionStatus;
use crate::network::Settings;

/// Default backoff schedule in milliseconds.
pub const DEFAULT_RECONNECT_DELAYS_MS: [u64; 10] =
    [200, 500, 1_000, 1_500, 2_000, 5_000, 10_000, 30_000, 60_000, 120_000];

/// What happens once every delay has been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Keep retrying at the last delay.
    #[default]
    RepeatLast,
    /// Stop the loop.
    GiveUp,
}

/// Backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    exhaustion: ExhaustionPolicy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delays: DEFAULT_RECONNECT_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            exhaustion: ExhaustionPolicy::RepeatLast,
        }
    }
}

impl ReconnectPolicy {
    /// Policy from explicit delays. An empty list means the default schedule.
    pub fn new(delays: Vec<Duration>, exhaustion: ExhaustionPolicy) -> Self {
        if delays.is_empty() {
            return Self {
                exhaustion,
                ..Self::default()
            };
        }
        Self { delays, exhaustion }
    }

    /// Policy described by settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let exhaustion = if settings.reconnect_give_up {
            ExhaustionPolicy::GiveUp
        } else {
            ExhaustionPolicy::RepeatLast
        };
        Self::new(
            settings
                .reconnect_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            exhaustion,
        )
    }

    /// Configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Exhaustion behaviour.
    pub fn exhaustion(&self) -> ExhaustionPolicy {
        self.exhaustion
    }

    /// Largest delay the schedule can produce.
    pub fn max_delay(&self) -> Duration {
        self.delays.iter().copied().max().unwrap_or_default()
    }

    /// Delay before the zero-based `attempt`, `None` once the policy gives up.
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self.delays.get(attempt) {
            Some(delay) => Some(*delay),
            None => match self.exhaustion {
                ExhaustionPolicy::RepeatLast => self.delays.last().copied(),
                ExhaustionPolicy::GiveUp => None,
            },
        }
    }

    /// Iterator over successive delays.
    pub fn schedule(&self) -> ReconnectSchedule {
        ReconnectSchedule {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Successive backoff delays for one reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    policy: ReconnectPolicy,
    attempt: usize,
}

impl ReconnectSchedule {
    /// Attempts handed out so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

impl Iterator for ReconnectSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for_attempt(self.attempt)?;
        self.attempt += 1;
        Some(delay)
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

struct Running {
    handle: JoinHandle<()>,
    stop_tx: broadcast::Sender<()>,
}

/// Clears the active marker and the live-loop count however the loop ends.
struct LoopGuard {
    id: u64,
    active: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let _ = self
            .active
            .compare_exchange(self.id, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single-instance reconnect loop for one [`ConnectionManager`].
pub struct ReconnectSupervisor {
    manager: Arc<ConnectionManager>,
    policy: ReconnectPolicy,
    /// Id of the active loop, zero when idle.
    active: Arc<AtomicU64>,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
    attempts: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl ReconnectSupervisor {
    /// Create an idle supervisor.
    pub fn new(manager: Arc<ConnectionManager>, policy: ReconnectPolicy) -> Self {
        Self {
            manager,
            policy,
            active: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
            live: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// The backoff policy.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start a loop unless one is active or a connect is already running.
    pub fn start(&self) -> bool {
        let mut running = lock(&self.running);

        if self.manager.status() == ConnectionStatus::Connecting {
            debug!("connect already in progress, not starting reconnect loop");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self
            .active
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnect loop already active");
            return false;
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LoopGuard {
            id,
            active: self.active.clone(),
            live: self.live.clone(),
        };
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(supervise(
            self.manager.clone(),
            self.policy.schedule(),
            stop_rx,
            self.attempts.clone(),
            guard,
        ));

        *running = Some(Running { handle, stop_tx });
        info!("reconnect loop started");
        true
    }

    /// Cancel the active loop, if any.
    ///
    /// An attempt cut off mid-connect leaves the status at `Connecting`;
    /// follow with [`ConnectionManager::disconnect`] when tearing down.
    pub fn stop(&self) {
        let mut running = lock(&self.running);
        if let Some(running) = running.take() {
            let _ = running.stop_tx.send(());
            running.handle.abort();
            debug!("reconnect loop stopped");
        }
        self.active.store(0, Ordering::SeqCst);
    }

    /// Whether a loop is active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    /// Loops currently executing. Never more than one.
    pub fn live_loops(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Reconnect attempts made over this supervisor's lifetime.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn supervise(
    manager: Arc<ConnectionManager>,
    mut schedule: ReconnectSchedule,
    mut stop_rx: broadcast::Receiver<()>,
    attempts: Arc<AtomicU64>,
    _guard: LoopGuard,
) {
    loop {
        let Some(delay) = schedule.next() else {
            warn!(attempts = schedule.attempt(), "reconnect schedule exhausted, giving up");
            break;
        };
        let attempt = schedule.attempt();
        debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if manager.status() == ConnectionStatus::Connected {
            info!("connection already restored");
            break;
        }

        attempts.fetch_add(1, Ordering::SeqCst);
        manager.disconnect().await;
        let outcome = tokio::select! {
            _ = stop_rx.recv() => break,
            outcome = manager.try_connect() => outcome,
        };

        match outcome {
            Ok(()) => {
                info!(attempt, "reconnected");
                break;
            }
            Err(err) if !err.is_retryable() => {
                error!(attempt, "giving up on reconnect: {}", err);
                break;
            }
            Err(err) => warn!(attempt, "reconnect attempt failed: {}", err),
        }
    }
}

//! Coordinator lifecycle controller with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state reads and an atomic counter with
//! RAII guards so the shutdown path can wait for handlers that are still
//! running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Coordinator lifecycle states.
///
/// State machine: `Created -> Initializing -> AwaitingPersistenceModule ->
/// Running -> ShuttingDown -> Stopped`. The coordinator refuses message
/// intake until a persistence module is registered, which is why
/// `AwaitingPersistenceModule` sits between storage load and `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed; nothing loaded or bound.
    Created,
    /// Loading persisted registry state.
    Initializing,
    /// Registration endpoint open; waiting for a persistence module.
    AwaitingPersistenceModule,
    /// Registration and intake endpoints both active.
    Running,
    /// Draining handlers and closing resources.
    ShuttingDown,
    /// Fully stopped.
    Stopped,
}

impl LifecycleState {
    /// Lowercase label for logs and the status endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::AwaitingPersistenceModule => "awaiting_persistence_module",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

/// Tracks the coordinator's lifecycle state, shutdown signal, and
/// in-flight handler count.
#[derive(Debug)]
pub struct LifecycleController {
    state: Arc<ArcSwap<LifecycleState>>,
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl LifecycleController {
    /// Creates a controller in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Created)),
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Moves to `state`.
    pub fn advance(&self, state: LifecycleState) {
        self.state.store(Arc::new(state));
    }

    /// Whether both endpoints are active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Receiver notified when shutdown is triggered. Long-lived loops
    /// select on this alongside their main work.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `ShuttingDown` and signals every shutdown receiver.
    pub fn trigger_shutdown(&self) {
        self.advance(LifecycleState::ShuttingDown);
        // Ignore send errors -- receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
    }

    /// RAII guard counting one in-flight handler. The count drops when
    /// the guard does, even if the handler panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current number of in-flight handlers.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until every in-flight handler finishes, up to `timeout`.
    ///
    /// Returns `true` (and moves to `Stopped`) when the drain completes;
    /// `false` when the timeout expires with handlers still running.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.advance(LifecycleState::Stopped);
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

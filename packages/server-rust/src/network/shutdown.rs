//! Process-wide shutdown coordination.
//!
//! The daemon stops on SIGINT/SIGTERM or when it is removed from the cluster.
//! Either path calls [`ShutdownController::trigger_shutdown`]; the control
//! listener, the peer listener and the binary's main task all watch the same
//! signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Daemon lifecycle: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Starting,
    Running,
    /// Control requests still in flight are finishing; new ones are refused.
    Draining,
    Stopped,
}

impl DaemonPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    phase: Arc<ArcSwap<DaemonPhase>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            phase: Arc::new(ArcSwap::from_pointee(DaemonPhase::Starting)),
        }
    }

    pub fn set_running(&self) {
        self.phase.store(Arc::new(DaemonPhase::Running));
    }

    #[must_use]
    pub fn phase(&self) -> DaemonPhase {
        **self.phase.load()
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    /// Moves to `Draining` and wakes every waiter. Idempotent.
    pub fn trigger_shutdown(&self) {
        if self.phase() != DaemonPhase::Stopped {
            self.phase.store(Arc::new(DaemonPhase::Draining));
        }
        self.signal.send_replace(true);
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait_for_trigger(&self) {
        let mut rx = self.signal.subscribe();
        // Err means the sender is gone, which only happens when we are dropped.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Tracks one in-flight control request until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for in-flight requests to finish. Moves to
    /// `Stopped` and returns `true` when they did.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.phase.store(Arc::new(DaemonPhase::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), DaemonPhase::Starting);
        controller.set_running();
        assert_eq!(controller.phase(), DaemonPhase::Running);
        assert!(!controller.is_triggered());
        controller.trigger_shutdown();
        assert_eq!(controller.phase(), DaemonPhase::Draining);
        assert!(controller.is_triggered());
    }

    #[test]
    fn guards_track_in_flight_requests() {
        let controller = ShutdownController::new();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(first);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let controller = Arc::new(ShutdownController::new());
        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.wait_for_trigger().await })
        };
        controller.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn trigger_before_wait_resolves_immediately() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        tokio::time::timeout(Duration::from_millis(100), controller.wait_for_trigger())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.phase(), DaemonPhase::Draining);
        drop(guard);
        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.phase(), DaemonPhase::Stopped);
    }
}

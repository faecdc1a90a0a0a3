//! Background loops owned by the cluster.

use std::future::Future;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Sums local health-check plugin weights into the local score.
    HealthChecks,
    /// Active side: probes peer connections and re-checks scores.
    ConnectionMonitor,
    /// Active side: sends heart-beats to passive members.
    HeartbeatFanOut,
    /// Passive side: watches for heart-beat silence.
    FailOverMonitor,
}

impl TaskKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HealthChecks => "health_checks",
            Self::ConnectionMonitor => "connection_monitor",
            Self::HeartbeatFanOut => "heartbeat_fan_out",
            Self::FailOverMonitor => "fail_over_monitor",
        }
    }
}

/// One running task per [`TaskKind`], all cancelled through a shared root
/// token.
#[derive(Debug)]
pub struct TaskSet {
    root: Mutex<CancellationToken>,
    tasks: DashMap<TaskKind, (CancellationToken, JoinHandle<()>)>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Mutex::new(CancellationToken::new()),
            tasks: DashMap::new(),
        }
    }

    /// Starts `kind` unless it is already running. Returns `true` if a task
    /// was spawned.
    pub fn spawn<F, Fut>(&self, kind: TaskKind, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.child_token();
        match self.tasks.entry(kind) {
            Entry::Occupied(mut running) => {
                if !running.get().1.is_finished() {
                    return false;
                }
                let handle = tokio::spawn(task(token.clone()));
                running.insert((token, handle));
            }
            Entry::Vacant(slot) => {
                let handle = tokio::spawn(task(token.clone()));
                slot.insert((token, handle));
            }
        }
        debug!(task = kind.as_str(), "task started");
        true
    }

    /// Signals `kind` to stop. The task finishes its current tick; it is not
    /// aborted, so a task may stop itself.
    pub fn stop(&self, kind: TaskKind) {
        if let Some((_, (token, _))) = self.tasks.remove(&kind) {
            token.cancel();
            debug!(task = kind.as_str(), "task stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.tasks
            .get(&kind)
            .is_some_and(|entry| !entry.1.is_finished() && !entry.0.is_cancelled())
    }

    #[must_use]
    pub fn running(&self) -> Vec<TaskKind> {
        self.tasks
            .iter()
            .filter(|entry| !entry.1.is_finished() && !entry.0.is_cancelled())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Token for short-lived work that must die with the cluster.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.root.lock().child_token()
    }

    /// Cancels and aborts everything and installs a fresh root token.
    pub fn reset(&self) {
        let old = std::mem::replace(&mut *self.root.lock(), CancellationToken::new());
        old.cancel();
        let kinds: Vec<TaskKind> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for kind in kinds {
            if let Some((_, (_, handle))) = self.tasks.remove(&kind) {
                handle.abort();
            }
        }
    }
}

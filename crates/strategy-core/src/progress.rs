use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Point-in-time view of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0-100.
    pub progress: f64,
    pub status: RunStatus,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            progress: 0.0,
            status: RunStatus::Idle,
        }
    }
}

struct TrackerState {
    running: AtomicBool,
    cancel_requested: AtomicBool,
    snapshots: watch::Sender<ProgressSnapshot>,
}

/// In-flight flag, progress and cancellation for one service instance.
///
/// Each engine owns its own tracker, so separate instances never share state.
#[derive(Clone)]
pub struct RunTracker {
    state: Arc<TrackerState>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(ProgressSnapshot::default());
        Self {
            state: Arc::new(TrackerState {
                running: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                snapshots,
            }),
        }
    }

    /// Claim the tracker for a run. Fails fast if a run is already in flight.
    pub fn begin(&self, operation: &str) -> EngineResult<RunGuard> {
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Concurrency(operation.to_string()));
        }
        self.state.cancel_requested.store(false, Ordering::Release);
        self.state.snapshots.send_replace(ProgressSnapshot {
            progress: 0.0,
            status: RunStatus::Running,
        });
        Ok(RunGuard {
            state: Arc::clone(&self.state),
            operation: operation.to_string(),
            finished: false,
        })
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> f64 {
        self.state.snapshots.borrow().progress
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.state.snapshots.borrow()
    }
}

/// Caller-side handle: poll, subscribe to progress events, or cancel.
#[derive(Clone)]
pub struct ProgressHandle {
    state: Arc<TrackerState>,
}

impl ProgressHandle {
    pub fn poll(&self) -> ProgressSnapshot {
        *self.state.snapshots.borrow()
    }

    /// Receiver notified on every progress or status change.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.state.snapshots.subscribe()
    }

    /// Request cooperative cancellation of the current run.
    ///
    /// Observed at the next simulation, generation or window boundary.
    pub fn cancel(&self) {
        if self.state.running.load(Ordering::Acquire) {
            self.state.cancel_requested.store(true, Ordering::Release);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

/// Exclusive claim on a tracker for the duration of one run.
///
/// Dropping the guard without calling [`RunGuard::complete`] marks the run
/// failed (or cancelled, if cancellation was requested) and always clears the
/// in-flight flag.
pub struct RunGuard {
    state: Arc<TrackerState>,
    operation: String,
    finished: bool,
}

impl RunGuard {
    /// Publish progress (0-100). Never moves backwards within a run.
    pub fn set_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 100.0);
        self.state.snapshots.send_if_modified(|snap| {
            if progress > snap.progress {
                snap.progress = progress;
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel_requested.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled(self.operation.clone()))
        } else {
            Ok(())
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn complete(mut self) {
        self.finished = true;
        self.state.snapshots.send_replace(ProgressSnapshot {
            progress: 100.0,
            status: RunStatus::Completed,
        });
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            let status = if self.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            self.state.snapshots.send_modify(|snap| snap.status = status);
        }
        self.state.cancel_requested.store(false, Ordering::Release);
        self.state.running.store(false, Ordering::Release);
    }
}

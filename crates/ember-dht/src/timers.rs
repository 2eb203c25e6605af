//! Cancelable one-shot timers.
//!
//! Every delayed action in the table (discovery rounds, refresh, the
//! eviction sweep) goes through one scheduler so that shutdown can cancel
//! everything at once. Callbacks must tolerate firing while the owning
//! object tears down; they observe the stopped flag before running, and
//! callers additionally capture only weak handles to shared state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

/// Handle to a scheduled callback.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancels the callback if it has not fired yet.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Schedules one-shot callbacks on the tokio runtime.
#[derive(Default)]
pub struct Scheduler {
    stopped: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a running scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `callback` after `delay`, unless the scheduler stops first.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let stopped = Arc::clone(&self.stopped);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if stopped.load(Ordering::Acquire) {
                return;
            }
            callback();
        });
        let abort = task.abort_handle();

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        if self.stopped.load(Ordering::Acquire) {
            task.abort();
        } else {
            tasks.push(task);
        }
        TimerHandle { abort }
    }

    /// Stops the scheduler and cancels every pending callback.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Returns true once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

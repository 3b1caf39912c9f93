//! Delay timer firing one-shot callbacks in deadline order.
//!
//! Entries live in one ordered map keyed by `(deadline, id)`. A single
//! driver task drains matured entries and runs their callbacks in key order,
//! so callbacks with equal deadlines fire in the order they were scheduled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Identifier of a scheduled timer, unique per [`DelayTimer`].
pub type TimerId = u64;

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TimerShared {
    entries: Mutex<BTreeMap<(Instant, TimerId), Callback>>,
    wake: Notify,
}

/// Schedules callbacks to run after a delay.
///
/// Must be used from within a tokio runtime.
pub struct DelayTimer {
    shared: Arc<TimerShared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    driver_started: AtomicBool,
    next_id: AtomicU64,
}

impl Default for DelayTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayTimer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared::default()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            driver_started: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `callback` once after `delay`, unless the timer is shut down first.
    ///
    /// The deadline is fixed when this is called. Returns `None` if the timer
    /// has already been shut down.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Option<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.shared.entries.lock();
            if self.cancel.is_cancelled() {
                return None;
            }
            entries.insert((deadline, id), Box::new(callback));
        }
        self.shared.wake.notify_one();

        if !self.driver_started.swap(true, Ordering::AcqRel) {
            self.tracker
                .spawn(drive(self.shared.clone(), self.cancel.clone()));
        }

        Some(id)
    }

    /// Timers scheduled but not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every pending timer and wait for running callbacks to return.
    pub async fn shutdown(&self) {
        let dropped = {
            let mut entries = self.shared.entries.lock();
            self.cancel.cancel();
            std::mem::take(&mut *entries)
        };
        if !dropped.is_empty() {
            tracing::debug!(cancelled = dropped.len(), "Delay timers cancelled");
        }
        drop(dropped);

        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Delay timer stopped");
    }
}

async fn drive(shared: Arc<TimerShared>, cancel: CancellationToken) {
    loop {
        let (due, next_deadline) = {
            let mut entries = shared.entries.lock();
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = entries.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove());
            }
            (due, entries.keys().next().map(|(deadline, _)| *deadline))
        };

        for callback in due {
            callback();
        }

        let sleep = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = sleep => {}
        }
    }
}

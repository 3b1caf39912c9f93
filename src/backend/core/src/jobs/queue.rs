//! FIFO job queue with blocking dequeue and delayed visibility.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::timer::DelayTimer;
use super::JobId;
use crate::error::{ConveyorError, Result};
use crate::telemetry::metrics::JobMetrics;

/// Called when a delayed job matures, before it becomes visible to workers.
///
/// Returning `false` drops the job instead of enqueueing it.
pub type PromoteHook = Arc<dyn Fn(JobId) -> bool + Send + Sync>;

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs ready for dequeue
    pub ready: usize,
    /// Jobs waiting for their delay to elapse
    pub delayed: usize,
    /// Jobs made ready since creation
    pub enqueued_total: u64,
    /// Jobs handed to workers since creation
    pub dequeued_total: u64,
    pub closed: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    closed: bool,
}

#[derive(Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    delayed: AtomicUsize,
    enqueued_total: AtomicU64,
    dequeued_total: AtomicU64,
}

impl QueueInner {
    fn push_locked(&self, state: &mut QueueState, id: JobId) -> Result<()> {
        if state.closed {
            return Err(ConveyorError::queue_closed());
        }
        state.ready.push_back(id);
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        JobMetrics::set_queue_depth(state.ready.len());
        Ok(())
    }
}

/// Concurrency-safe FIFO of ready job ids.
///
/// Every id handed out by [`JobQueue::dequeue`] is removed under the queue
/// lock, so a single enqueue is delivered to exactly one worker.
pub struct JobQueue {
    inner: Arc<QueueInner>,
    timer: Arc<DelayTimer>,
    promote_hook: Option<PromoteHook>,
}

impl JobQueue {
    /// Create a queue whose delayed entries are driven by `timer`.
    pub fn new(timer: Arc<DelayTimer>) -> Self {
        Self {
            inner: Arc::new(QueueInner::default()),
            timer,
            promote_hook: None,
        }
    }

    /// Install the hook run when a delayed job matures.
    pub fn with_promote_hook(mut self, hook: PromoteHook) -> Self {
        self.promote_hook = Some(hook);
        self
    }

    /// Insert a job that is visible to `dequeue` immediately.
    pub fn enqueue(&self, id: JobId) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            self.inner.push_locked(&mut state, id)?;
        }
        self.inner.notify.notify_one();
        tracing::trace!(job_id = %id, "Job enqueued");
        Ok(())
    }

    /// Run `create` and enqueue the id it returns, both under the queue lock.
    ///
    /// `create` is not called once the queue is closed, so a rejected
    /// enqueue leaves nothing behind.
    pub fn enqueue_with<T, F>(&self, create: F) -> Result<T>
    where
        F: FnOnce() -> (JobId, T),
    {
        let (id, value) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ConveyorError::queue_closed());
            }
            let (id, value) = create();
            self.inner.push_locked(&mut state, id)?;
            (id, value)
        };
        self.inner.notify.notify_one();
        tracing::trace!(job_id = %id, "Job enqueued");
        Ok(value)
    }

    /// Insert a job that becomes visible only after `delay` has elapsed.
    pub fn enqueue_delayed(&self, id: JobId, delay: Duration) -> Result<()> {
        if self.inner.state.lock().closed {
            return Err(ConveyorError::queue_closed());
        }

        let inner = self.inner.clone();
        let hook = self.promote_hook.clone();
        inner.delayed.fetch_add(1, Ordering::Relaxed);

        let scheduled = self.timer.schedule(delay, {
            let inner = inner.clone();
            move || {
                inner.delayed.fetch_sub(1, Ordering::Relaxed);

                let pushed = {
                    let mut state = inner.state.lock();
                    if state.closed {
                        tracing::debug!(job_id = %id, "Queue closed, delayed job dropped");
                        false
                    } else if hook.as_ref().map_or(true, |hook| hook(id)) {
                        inner.push_locked(&mut state, id).is_ok()
                    } else {
                        tracing::warn!(job_id = %id, "Delayed job rejected by promote hook");
                        false
                    }
                };

                if pushed {
                    inner.notify.notify_one();
                    tracing::trace!(job_id = %id, "Delayed job became ready");
                }
            }
        });

        if scheduled.is_none() {
            inner.delayed.fetch_sub(1, Ordering::Relaxed);
            return Err(ConveyorError::queue_closed());
        }
        Ok(())
    }

    /// Wait until a job is ready and take it.
    ///
    /// Returns `None` once the queue is closed; jobs still waiting in the
    /// queue at that point are not handed out.
    pub async fn dequeue(&self) -> Option<JobId> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.ready.pop_front() {
                    self.inner.dequeued_total.fetch_add(1, Ordering::Relaxed);
                    JobMetrics::set_queue_depth(state.ready.len());
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    /// Take a ready job without waiting.
    pub fn try_dequeue(&self) -> Option<JobId> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        let id = state.ready.pop_front()?;
        self.inner.dequeued_total.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    /// Stop handing out jobs and wake every waiting worker.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
        tracing::debug!("Job queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of ready jobs.
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            ready: state.ready.len(),
            delayed: self.inner.delayed.load(Ordering::Relaxed),
            enqueued_total: self.inner.enqueued_total.load(Ordering::Relaxed),
            dequeued_total: self.inner.dequeued_total.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }
}

//! Engine facade wiring store, queue, workers, retries and schedules.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::queue::{JobQueue, QueueStats};
use super::retry::{RetryController, RetryPolicy};
use super::scheduler::{fixed_payload, JobScheduler, ScheduleId, ScheduleOptions};
use super::store::{JobFilter, JobStore, StateCounts};
use super::submit::{JobSubmitter, SubmitRequest};
use super::timer::DelayTimer;
use super::worker::{
    HandlerRegistry, JobHandler, WorkerHandle, WorkerPool, WorkerStats, WorkerStatsSnapshot,
};
use super::{HandlerResult, JobContext, JobId, JobRecord, Payload};
use crate::config::{EngineConfig, ScheduleConfig};
use crate::error::{ConveyorError, Result};

/// Aggregate engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub jobs: StateCounts,
    pub queue: QueueStats,
    pub workers: WorkerStatsSnapshot,
    /// Retry timers not yet fired
    pub pending_retries: usize,
    /// Schedules that will still tick
    pub schedules: usize,
}

/// Result of [`JobEngine::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// All running handlers finished within the grace period
    pub graceful: bool,
    /// Jobs left in `Running` because their handler was aborted
    pub abandoned: u64,
    /// Jobs left in `Queued`
    pub queued: usize,
    /// Jobs left in `Retrying` whose timer was cancelled
    pub retrying: usize,
}

enum Lifecycle {
    Idle(WorkerPool),
    Running(WorkerHandle),
    Stopped,
}

/// Builder for [`JobEngine`].
pub struct JobEngineBuilder {
    config: EngineConfig,
    retry_policy: Option<RetryPolicy>,
    registry: HandlerRegistry,
}

impl Default for JobEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JobEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            retry_policy: None,
            registry: HandlerRegistry::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn shutdown_grace_period(mut self, grace: std::time::Duration) -> Self {
        self.config.shutdown_grace_period = grace;
        self
    }

    pub fn reject_unknown_types(mut self, reject: bool) -> Self {
        self.config.reject_unknown_types = reject;
        self
    }

    /// Retry policy; its `default_max_attempts` replaces the configured one.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn handler(mut self, job_type: impl Into<String>, handler: impl JobHandler) -> Self {
        self.registry.register(job_type, handler);
        self
    }

    pub fn handler_arc(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.registry.register_arc(job_type, handler);
        self
    }

    pub fn blocking_handler<F>(mut self, job_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register_blocking(job_type, f);
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Assemble the engine. Workers are not spawned until
    /// [`JobEngine::start`], which must run inside a tokio runtime.
    pub fn build(self) -> Result<JobEngine> {
        let mut config = self.config;
        let policy = match self.retry_policy {
            Some(policy) => {
                config.default_max_attempts = policy.default_max_attempts;
                policy
            }
            None => RetryPolicy {
                default_max_attempts: config.default_max_attempts,
                ..RetryPolicy::default()
            },
        };

        if config.workers == 0 {
            return Err(ConveyorError::configuration("engine.workers must be at least 1"));
        }
        if config.default_max_attempts == 0 {
            return Err(ConveyorError::invalid_max_attempts(0));
        }

        let store = Arc::new(JobStore::new());
        let timer = Arc::new(DelayTimer::new());
        let queue = Arc::new(JobQueue::new(timer.clone()).with_promote_hook({
            let store = store.clone();
            Arc::new(move |id: JobId| store.requeue(id).is_ok())
        }));
        let registry = Arc::new(self.registry);
        let retry = Arc::new(RetryController::new(store.clone(), queue.clone(), policy));
        let submitter = JobSubmitter::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            config.default_max_attempts,
        )
        .reject_unknown_types(config.reject_unknown_types);
        let scheduler = JobScheduler::new(submitter.clone(), store.clone());
        let pool = WorkerPool::new(
            config.worker_config(),
            store.clone(),
            queue.clone(),
            registry.clone(),
            retry,
            submitter.clone(),
        );
        let worker_stats = pool.stats();

        Ok(JobEngine {
            config,
            store,
            queue,
            timer,
            registry,
            submitter,
            scheduler,
            worker_stats,
            lifecycle: Mutex::new(Lifecycle::Idle(pool)),
        })
    }
}

/// In-process background job engine.
///
/// ```rust,no_run
/// use conveyor_core::jobs::{handler_fn, payload, JobEngine, JobOutcome};
///
/// # async fn run() -> conveyor_core::Result<()> {
/// let engine = JobEngine::builder()
///     .workers(4)
///     .handler("send_email", handler_fn(|ctx| async move {
///         ctx.log_info("sending");
///         Ok(JobOutcome::done())
///     }))
///     .build()?;
///
/// engine.start()?;
/// let id = engine.submit("send_email", payload(serde_json::json!({"email": "a@b.com"})), None)?;
/// let record = engine.get_status(id)?;
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct JobEngine {
    config: EngineConfig,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    timer: Arc<DelayTimer>,
    registry: Arc<HandlerRegistry>,
    submitter: JobSubmitter,
    scheduler: JobScheduler,
    worker_stats: WorkerStats,
    lifecycle: Mutex<Lifecycle>,
}

impl JobEngine {
    pub fn builder() -> JobEngineBuilder {
        JobEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Spawn the workers. Jobs submitted before this call wait in the queue.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(pool) => {
                *lifecycle = Lifecycle::Running(pool.start());
                tracing::info!(
                    engine = %self.config.name,
                    workers = self.config.workers,
                    job_types = ?self.registry.job_types(),
                    "Job engine started"
                );
                Ok(())
            }
            running @ Lifecycle::Running(_) => {
                *lifecycle = running;
                Err(ConveyorError::engine_already_running())
            }
            Lifecycle::Stopped => Err(ConveyorError::engine_not_running()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Submit a job. See [`JobSubmitter::submit`].
    pub fn submit(&self, job_type: &str, payload: Payload, max_attempts: Option<u32>) -> Result<JobId> {
        self.submitter.submit(job_type, payload, max_attempts)
    }

    pub fn submit_request(&self, request: SubmitRequest) -> Result<JobId> {
        self.submitter.submit_request(request)
    }

    /// A cloneable submission handle for producers.
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    /// Snapshot of a job's record.
    pub fn get_status(&self, id: JobId) -> Result<JobRecord> {
        self.store.get(id)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.store.list(filter)
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Register a schedule declared in configuration.
    pub fn schedule_from_config(&self, schedule: &ScheduleConfig) -> Result<ScheduleId> {
        let mut options = ScheduleOptions {
            name: schedule.name.clone(),
            max_attempts: schedule.max_attempts,
            run_immediately: schedule.run_immediately,
            overlap: schedule.overlap,
        };
        let factory = fixed_payload(schedule.payload.clone());

        match (schedule.interval, schedule.cron.as_deref()) {
            (Some(interval), None) => {
                self.scheduler
                    .schedule_interval(&schedule.job_type, interval, factory, options)
            }
            (None, Some(expression)) => {
                options.run_immediately = false;
                self.scheduler
                    .schedule_cron(&schedule.job_type, expression, factory, options)
            }
            _ => Err(ConveyorError::invalid_schedule(format!(
                "schedule for '{}' must set exactly one of interval or cron",
                schedule.job_type
            ))),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            jobs: self.store.counts(),
            queue: self.queue.stats(),
            workers: self.worker_stats.snapshot(),
            pending_retries: self.timer.pending(),
            schedules: self.scheduler.active_count(),
        }
    }

    /// Stop the engine.
    ///
    /// Schedules stop ticking and pending retry timers are cancelled, so jobs
    /// waiting in `Retrying` stay there. The queue is closed, idle workers
    /// exit, and running handlers get up to `shutdown_grace_period` to finish
    /// before they are aborted.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let lifecycle = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if matches!(lifecycle, Lifecycle::Stopped) {
            return Err(ConveyorError::engine_not_running());
        }

        tracing::info!(engine = %self.config.name, "Job engine shutting down");

        self.scheduler.shutdown().await;
        self.timer.shutdown().await;

        let (graceful, abandoned) = match lifecycle {
            Lifecycle::Running(handle) => {
                let result = handle.shutdown(self.config.shutdown_grace_period).await;
                (result.graceful, result.abandoned)
            }
            _ => {
                self.queue.close();
                (true, 0)
            }
        };

        let counts = self.store.counts();
        let report = ShutdownReport {
            graceful,
            abandoned,
            queued: counts.queued,
            retrying: counts.retrying,
        };

        tracing::info!(
            engine = %self.config.name,
            graceful = report.graceful,
            abandoned = report.abandoned,
            queued = report.queued,
            retrying = report.retrying,
            completed = counts.completed,
            failed = counts.failed,
            "Job engine stopped"
        );
        Ok(report)
    }
}

//! Worker pool for concurrent job execution.
//!
//! A fixed number of worker tasks share one [`JobQueue`]. Each dequeued job
//! is run on its own spawned task so that a panicking handler is reported
//! through its `JoinError` instead of taking the worker down with it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::queue::JobQueue;
use super::retry::{RetryController, RetryDecision};
use super::store::JobStore;
use super::submit::{JobSubmitter, SubmitRequest};
use super::{HandlerResult, JobContext, JobError, JobId, JobOutcome, JobRecord};
use crate::telemetry::metrics::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> impl JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> JobHandler for BlockingHandler<F>
where
    F: Fn(JobContext) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let f = self.0.clone();
        match tokio::task::spawn_blocking(move || f(ctx)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::panicked(panic_message(e.into_panic()))),
            Err(e) => Err(JobError::retryable(format!("blocking handler cancelled: {}", e))),
        }
    }
}

/// Wrap a synchronous closure as a handler run on the blocking thread pool.
pub fn blocking_fn<F>(f: F) -> impl JobHandler
where
    F: Fn(JobContext) -> HandlerResult + Send + Sync + 'static,
{
    BlockingHandler(Arc::new(f))
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Mapping from job type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type = %job_type, "Handler replaced");
        }
        self
    }

    /// Register a synchronous handler that may block.
    pub fn register_blocking<F>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(job_type, blocking_fn(f))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration & Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Prefix of worker names in logs
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            name: "conveyor-worker".to_string(),
        }
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Attempts started
    pub processed: Arc<AtomicU64>,
    /// Attempts that completed their job
    pub succeeded: Arc<AtomicU64>,
    /// Attempts that failed their job permanently
    pub failed: Arc<AtomicU64>,
    /// Attempts that scheduled a retry
    pub retried: Arc<AtomicU64>,
    /// Attempts whose handler panicked
    pub panicked: Arc<AtomicU64>,
    /// Handlers currently executing
    pub active: Arc<AtomicU64>,
    /// Highest observed value of `active`
    pub peak_active: Arc<AtomicU64>,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub panicked: u64,
    pub active: u64,
    pub peak_active: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            retried: self.retried.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            active: self.active(),
            peak_active: self.peak_active.load(Ordering::Relaxed),
        }
    }

    fn begin(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_active.fetch_max(active, Ordering::Relaxed);
    }

    fn end(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of stopping the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerShutdown {
    /// Every worker drained within the grace period
    pub graceful: bool,
    /// Jobs whose handler was aborted; they remain `Running`
    pub abandoned: u64,
}

struct WorkerShared {
    config: WorkerConfig,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    retry: Arc<RetryController>,
    submitter: JobSubmitter,
    stats: WorkerStats,
    abandoned: AtomicU64,
}

/// Pool of workers that process jobs from a queue.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        store: Arc<JobStore>,
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        retry: Arc<RetryController>,
        submitter: JobSubmitter,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                config,
                store,
                queue,
                registry,
                retry,
                submitter,
                stats: WorkerStats::new(),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.clone()
    }

    /// Spawn the workers, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for index in 0..self.shared.config.workers {
            let shared = self.shared.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { shared.run(index, cancel).await });
        }

        tracing::info!(
            worker = %self.shared.config.name,
            workers = self.shared.config.workers,
            "Worker pool started"
        );

        WorkerHandle {
            shared: self.shared,
            tasks,
            cancel,
        }
    }
}

impl WorkerShared {
    async fn run(self: Arc<Self>, index: usize, cancel: CancellationToken) {
        let name = format!("{}-{}", self.config.name, index);
        tracing::debug!(worker = %name, "Worker started");

        loop {
            let job_id = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            if !self.process(&name, job_id, &cancel).await {
                break;
            }
        }

        tracing::debug!(worker = %name, "Worker stopped");
    }

    /// Run one attempt of `job_id`. Returns `false` if the worker was
    /// cancelled while the handler was executing.
    async fn process(&self, worker: &str, job_id: JobId, cancel: &CancellationToken) -> bool {
        let record = match self.store.begin_attempt(job_id) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(worker = %worker, job_id = %job_id, error = %e, "Dequeued job cannot start");
                return true;
            }
        };

        self.stats.begin();
        JobMetrics::started(&record.job_type);
        tracing::debug!(
            worker = %worker,
            job_id = %job_id,
            job_type = %record.job_type,
            attempt = record.attempts,
            max_attempts = record.max_attempts,
            "Job attempt started"
        );

        let started = Instant::now();
        let result = match self.registry.get(&record.job_type) {
            None => Err(JobError::missing_handler(&record.job_type)),
            Some(handler) => {
                let ctx = JobContext::from_record(&record);
                let span = tracing::info_span!(
                    "job",
                    job_id = %job_id,
                    job_type = %record.job_type,
                    attempt = record.attempts
                );
                let task = tokio::spawn(async move { handler.handle(ctx).await }.instrument(span));
                let abort = task.abort_handle();

                tokio::select! {
                    joined = task => match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                            Err(JobError::panicked(panic_message(e.into_panic())))
                        }
                        Err(e) => Err(JobError::retryable(format!("handler task cancelled: {}", e))),
                    },
                    _ = cancel.cancelled() => {
                        abort.abort();
                        self.stats.end();
                        self.abandoned.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::finished(&record.job_type, started.elapsed().as_secs_f64(), false);
                        tracing::warn!(
                            worker = %worker,
                            job_id = %job_id,
                            job_type = %record.job_type,
                            "Job abandoned at shutdown"
                        );
                        return false;
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        self.stats.end();
        JobMetrics::finished(&record.job_type, elapsed.as_secs_f64(), result.is_ok());

        match result {
            Ok(outcome) => self.on_success(worker, &record, outcome, elapsed),
            Err(error) => self.on_error(&record, &error),
        }
        true
    }

    fn on_success(&self, worker: &str, record: &JobRecord, outcome: JobOutcome, elapsed: Duration) {
        if let Err(e) = self.store.complete(record.id) {
            e.log();
            return;
        }
        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        JobMetrics::completed(&record.job_type);

        tracing::info!(
            worker = %worker,
            job_id = %record.id,
            job_type = %record.job_type,
            attempt = record.attempts,
            duration_ms = elapsed.as_millis() as u64,
            follow_ups = outcome.follow_ups.len(),
            "Job completed"
        );

        // Children are created only after the parent is Completed
        for follow_up in outcome.follow_ups {
            let request = SubmitRequest::from(follow_up)
                .parent(record.id)
                .correlation(record.correlation_id);
            let job_type = request.job_type.clone();

            match self.submitter.submit_request(request) {
                Ok(child_id) => tracing::debug!(
                    parent_id = %record.id,
                    job_id = %child_id,
                    job_type = %job_type,
                    "Chained job submitted"
                ),
                Err(e) => tracing::error!(
                    parent_id = %record.id,
                    job_type = %job_type,
                    error = %e,
                    "Failed to submit chained job"
                ),
            }
        }
    }

    fn on_error(&self, record: &JobRecord, error: &JobError) {
        match self.retry.on_failure(record.id, error) {
            Ok(RetryDecision::Retry { .. }) => {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
            }
            Ok(RetryDecision::GiveUp) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => e.log(),
        }
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.shared.stats
    }

    /// Close the queue and wait up to `grace` for in-flight handlers to
    /// finish, then abort whatever is still running.
    pub async fn shutdown(mut self, grace: Duration) -> WorkerShutdown {
        self.shared.queue.close();

        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            self.cancel.cancel();
            while self.tasks.join_next().await.is_some() {}
        }

        let report = WorkerShutdown {
            graceful: drained,
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
        };
        tracing::info!(
            worker = %self.shared.config.name,
            graceful = report.graceful,
            abandoned = report.abandoned,
            "Worker pool stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::timer::DelayTimer;
    use crate::jobs::{JobState, Payload};

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);

        stats.begin();
        stats.begin();
        stats.end();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.peak_active, 2);
    }

    #[test]
    fn test_registry() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("b", handler_fn(|_ctx| async { Ok(JobOutcome::done()) }))
            .register_blocking("a", |_ctx| Ok(JobOutcome::done()));

        assert_eq!(registry.job_types(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42)), "unknown panic payload");
    }

    struct Fixture {
        store: Arc<JobStore>,
        submitter: JobSubmitter,
        handle: WorkerHandle,
    }

    fn start_pool(registry: HandlerRegistry, workers: usize) -> Fixture {
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(JobQueue::new(Arc::new(DelayTimer::new())).with_promote_hook({
            let store = store.clone();
            Arc::new(move |id: JobId| store.requeue(id).is_ok())
        }));
        let registry = Arc::new(registry);
        let retry = Arc::new(RetryController::new(
            store.clone(),
            queue.clone(),
            RetryPolicy::exponential(Duration::from_millis(10), 2.0),
        ));
        let submitter = JobSubmitter::new(store.clone(), queue.clone(), registry.clone(), 3);
        let pool = WorkerPool::new(
            WorkerConfig {
                workers,
                name: "test".to_string(),
            },
            store.clone(),
            queue,
            registry,
            retry,
            submitter.clone(),
        );

        Fixture {
            store,
            submitter,
            handle: pool.start(),
        }
    }

    async fn wait_terminal(store: &JobStore, id: JobId) -> JobRecord {
        loop {
            let record = store.get(id).unwrap();
            if record.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "explode",
            handler_fn(|ctx| async move {
                if ctx.attempt > 0 {
                    panic!("kaboom");
                }
                Ok(JobOutcome::done())
            }),
        );
        registry.register("fine", handler_fn(|_ctx| async { Ok(JobOutcome::done()) }));
        let fixture = start_pool(registry, 1);

        let bad = fixture.submitter.submit("explode", Payload::new(), Some(2)).unwrap();
        let record = wait_terminal(&fixture.store, bad).await;
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 2);
        assert!(record.last_error.unwrap().contains("kaboom"));

        // The single worker survived and still processes jobs
        let good = fixture.submitter.submit("fine", Payload::new(), None).unwrap();
        assert_eq!(wait_terminal(&fixture.store, good).await.state, JobState::Completed);
        assert_eq!(fixture.handle.stats().snapshot().panicked, 2);

        let report = fixture.handle.shutdown(Duration::from_secs(1)).await;
        assert!(report.graceful);
    }

    #[tokio::test]
    async fn test_blocking_handler_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register_blocking("sync", |ctx| {
            std::thread::sleep(Duration::from_millis(5));
            if ctx.attempt == 1 {
                Err(JobError::retryable("first try"))
            } else {
                Ok(JobOutcome::done())
            }
        });
        let fixture = start_pool(registry, 2);

        let id = fixture.submitter.submit("sync", Payload::new(), None).unwrap();
        let record = wait_terminal(&fixture.store, id).await;
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 2);

        fixture.handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_long_running_jobs() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "slow",
            handler_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(JobOutcome::done())
            }),
        );
        let fixture = start_pool(registry, 2);

        let id = fixture.submitter.submit("slow", Payload::new(), None).unwrap();
        while fixture.store.get(id).unwrap().state != JobState::Running {
            tokio::task::yield_now().await;
        }

        let report = fixture.handle.shutdown(Duration::from_secs(5)).await;
        assert!(!report.graceful);
        assert_eq!(report.abandoned, 1);
        assert_eq!(fixture.store.get(id).unwrap().state, JobState::Running);
    }
}

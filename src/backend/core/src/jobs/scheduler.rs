//! Periodic dispatch with interval, cron and one-shot schedules.
//!
//! Every schedule runs on its own tokio task and submits a job through the
//! [`JobSubmitter`] on each tick, exactly like an external producer would.
//! Ticks are independent by default: a slow job does not delay or suppress
//! the next tick, so several jobs of one schedule can be in flight at once.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::store::JobStore;
use super::submit::{JobSubmitter, SubmitRequest};
use super::{JobId, Payload};
use crate::error::{ConveyorError, Result};
use crate::telemetry::metrics::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Specification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed cron expression.
///
/// Accepts the classic five fields (minute hour day month weekday), six with
/// a leading seconds field, or seven with a trailing year. Five-field
/// expressions fire at second zero.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let normalized = match expression.split_whitespace().count() {
            5 => format!("0 {}", expression),
            6 | 7 => expression.to_string(),
            fields => {
                return Err(ConveyorError::invalid_schedule(format!(
                    "cron expression '{}' has {} fields, expected 5 to 7",
                    expression, fields
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

/// When a schedule ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    /// Run once at a specific time
    Once(DateTime<Utc>),
    /// Run on a cron schedule
    Cron(CronSchedule),
    /// Run at fixed intervals
    Interval(Duration),
}

impl ScheduleSpec {
    /// Next tick strictly after `after`, if there is one.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once(at) => (*at > after).then_some(*at),
            Self::Cron(cron) => cron.next_after(&after),
            Self::Interval(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .map(|step| after + step),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once(at) => write!(f, "once at {}", at.to_rfc3339()),
            Self::Cron(cron) => write!(f, "cron '{}'", cron.expression()),
            Self::Interval(interval) => write!(f, "every {:?}", interval),
        }
    }
}

/// What a tick does while the schedule's previous job is still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Submit regardless; jobs of one schedule may overlap
    #[default]
    Allow,
    /// Skip the tick while the previous job has not reached a terminal state
    SkipIfRunning,
}

/// Produces the payload of each scheduled job.
pub type PayloadFactory = Arc<dyn Fn() -> Payload + Send + Sync>;

/// Factory returning the same payload on every tick.
pub fn fixed_payload(payload: Payload) -> PayloadFactory {
    Arc::new(move || payload.clone())
}

/// Per-schedule options.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Display name; defaults to the job type
    pub name: Option<String>,
    /// Attempt ceiling of submitted jobs; engine default when `None`
    pub max_attempts: Option<u32>,
    /// Interval schedules tick once immediately on registration
    pub run_immediately: bool,
    pub overlap: OverlapPolicy,
}

impl ScheduleOptions {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    pub fn overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }
}

/// Observable state of a schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub id: ScheduleId,
    pub name: String,
    pub job_type: String,
    /// Human-readable timing, e.g. "every 10s"
    pub spec: String,
    pub overlap: OverlapPolicy,
    /// Whether further ticks will happen
    pub active: bool,
    /// Ticks that submitted a job
    pub run_count: u64,
    /// Ticks skipped by the overlap policy or rejected by submission
    pub skipped_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_job_id: Option<JobId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

struct ScheduleEntry {
    info: Arc<Mutex<ScheduleInfo>>,
    cancel: CancellationToken,
}

/// Everything a schedule task needs to submit on a tick.
struct Ticker {
    id: ScheduleId,
    job_type: String,
    spec: ScheduleSpec,
    factory: PayloadFactory,
    options: ScheduleOptions,
    submitter: JobSubmitter,
    store: Arc<JobStore>,
    info: Arc<Mutex<ScheduleInfo>>,
}

impl Ticker {
    fn tick(&self) {
        let now = Utc::now();
        let name = self.info.lock().name.clone();

        if self.options.overlap == OverlapPolicy::SkipIfRunning {
            let previous = self.info.lock().last_job_id;
            if let Some(previous) = previous.filter(|id| self.store.is_in_flight(*id)) {
                let mut info = self.info.lock();
                info.skipped_count += 1;
                info.next_run = self.spec.next_after(now);
                drop(info);

                JobMetrics::schedule_tick(&name, false);
                tracing::debug!(
                    schedule = %name,
                    previous_job_id = %previous,
                    "Tick skipped, previous job still in flight"
                );
                return;
            }
        }

        let mut request = SubmitRequest::new(self.job_type.clone(), (self.factory)()).schedule(self.id);
        request.max_attempts = self.options.max_attempts;
        let submitted = self.submitter.submit_request(request);

        let mut info = self.info.lock();
        info.next_run = self.spec.next_after(now);
        match submitted {
            Ok(job_id) => {
                info.run_count += 1;
                info.last_run = Some(now);
                info.last_job_id = Some(job_id);
                drop(info);

                JobMetrics::schedule_tick(&name, true);
                tracing::debug!(schedule = %name, job_id = %job_id, "Scheduled job submitted");
            }
            Err(e) => {
                info.skipped_count += 1;
                drop(info);

                JobMetrics::schedule_tick(&name, false);
                tracing::warn!(schedule = %name, error = %e, "Scheduled submission rejected");
            }
        }
    }

    async fn run(self, cancel: CancellationToken) {
        match self.spec.clone() {
            ScheduleSpec::Interval(interval) => self.run_interval(interval, cancel).await,
            ScheduleSpec::Cron(cron) => self.run_cron(cron, cancel).await,
            ScheduleSpec::Once(at) => self.run_once(at, cancel).await,
        }
        self.info.lock().active = false;
    }

    async fn run_interval(&self, interval: Duration, cancel: CancellationToken) {
        let start = if self.options.run_immediately {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + interval
        };
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    async fn run_cron(&self, cron: CronSchedule, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let Some(next) = cron.next_after(&now) else {
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => self.tick(),
            }
        }
    }

    async fn run_once(&self, at: DateTime<Utc>, cancel: CancellationToken) {
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => self.tick(),
        }
    }
}

/// Job scheduler managing recurring and one-time submissions.
pub struct JobScheduler {
    submitter: JobSubmitter,
    store: Arc<JobStore>,
    schedules: RwLock<HashMap<ScheduleId, ScheduleEntry>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobScheduler {
    pub fn new(submitter: JobSubmitter, store: Arc<JobStore>) -> Self {
        Self {
            submitter,
            store,
            schedules: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Submit `job_type` every `interval`.
    pub fn schedule_interval(
        &self,
        job_type: &str,
        interval: Duration,
        factory: PayloadFactory,
        options: ScheduleOptions,
    ) -> Result<ScheduleId> {
        if interval.is_zero() {
            return Err(ConveyorError::invalid_schedule("interval must be greater than zero"));
        }
        self.schedule(job_type, ScheduleSpec::Interval(interval), factory, options)
    }

    /// Submit `job_type` on every occurrence of a cron expression (UTC).
    pub fn schedule_cron(
        &self,
        job_type: &str,
        expression: &str,
        factory: PayloadFactory,
        options: ScheduleOptions,
    ) -> Result<ScheduleId> {
        let cron = CronSchedule::parse(expression)?;
        self.schedule(job_type, ScheduleSpec::Cron(cron), factory, options)
    }

    /// Submit `job_type` once at `at`, or immediately if `at` has passed.
    pub fn schedule_once(
        &self,
        job_type: &str,
        at: DateTime<Utc>,
        factory: PayloadFactory,
        options: ScheduleOptions,
    ) -> Result<ScheduleId> {
        self.schedule(job_type, ScheduleSpec::Once(at), factory, options)
    }

    /// Register a schedule and start its task. Must be called within a
    /// tokio runtime.
    pub fn schedule(
        &self,
        job_type: &str,
        spec: ScheduleSpec,
        factory: PayloadFactory,
        options: ScheduleOptions,
    ) -> Result<ScheduleId> {
        if self.cancel.is_cancelled() {
            return Err(ConveyorError::engine_not_running());
        }
        if job_type.trim().is_empty() {
            return Err(ConveyorError::invalid_schedule("job type must not be empty"));
        }
        if options.max_attempts == Some(0) {
            return Err(ConveyorError::invalid_max_attempts(0));
        }

        let id = ScheduleId::new();
        let now = Utc::now();
        let next_run = match &spec {
            ScheduleSpec::Interval(_) if options.run_immediately => Some(now),
            ScheduleSpec::Once(at) => Some((*at).max(now)),
            _ => spec.next_after(now),
        };
        let name = options.name.clone().unwrap_or_else(|| job_type.to_string());

        let info = Arc::new(Mutex::new(ScheduleInfo {
            id,
            name: name.clone(),
            job_type: job_type.to_string(),
            spec: spec.to_string(),
            overlap: options.overlap,
            active: true,
            run_count: 0,
            skipped_count: 0,
            last_run: None,
            next_run,
            last_job_id: None,
        }));
        let cancel = self.cancel.child_token();

        tracing::info!(
            schedule = %name,
            schedule_id = %id,
            job_type = %job_type,
            spec = %spec,
            "Schedule registered"
        );

        let ticker = Ticker {
            id,
            job_type: job_type.to_string(),
            spec,
            factory,
            options,
            submitter: self.submitter.clone(),
            store: self.store.clone(),
            info: info.clone(),
        };
        self.tracker.spawn(ticker.run(cancel.clone()));

        self.schedules
            .write()
            .insert(id, ScheduleEntry { info, cancel });
        Ok(id)
    }

    /// Stop and remove a schedule. Jobs it already submitted are unaffected.
    pub fn cancel(&self, id: ScheduleId) -> Result<()> {
        let entry = self
            .schedules
            .write()
            .remove(&id)
            .ok_or_else(|| ConveyorError::schedule_not_found(id))?;
        entry.cancel.cancel();
        entry.info.lock().active = false;

        tracing::info!(schedule_id = %id, "Schedule cancelled");
        Ok(())
    }

    pub fn get(&self, id: ScheduleId) -> Result<ScheduleInfo> {
        self.schedules
            .read()
            .get(&id)
            .map(|entry| entry.info.lock().clone())
            .ok_or_else(|| ConveyorError::schedule_not_found(id))
    }

    /// All registered schedules, sorted by name.
    pub fn list(&self) -> Vec<ScheduleInfo> {
        let mut schedules: Vec<ScheduleInfo> = self
            .schedules
            .read()
            .values()
            .map(|entry| entry.info.lock().clone())
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    /// Schedules that will still tick. Fired one-shot and stopped schedules
    /// stay queryable through [`JobScheduler::get`] but are not counted.
    pub fn active_count(&self) -> usize {
        self.schedules
            .read()
            .values()
            .filter(|entry| entry.info.lock().active)
            .count()
    }

    /// Stop every schedule and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(schedules = self.schedules.read().len(), "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::queue::JobQueue;
    use crate::jobs::timer::DelayTimer;
    use crate::jobs::worker::HandlerRegistry;
    use crate::jobs::JobState;
    use chrono::TimeZone;

    fn scheduler() -> (Arc<JobStore>, Arc<JobQueue>, JobScheduler) {
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(JobQueue::new(Arc::new(DelayTimer::new())));
        let submitter = JobSubmitter::new(
            store.clone(),
            queue.clone(),
            Arc::new(HandlerRegistry::new()),
            3,
        );
        let scheduler = JobScheduler::new(submitter, store.clone());
        (store, queue, scheduler)
    }

    fn empty() -> PayloadFactory {
        fixed_payload(Payload::new())
    }

    #[test]
    fn test_cron_parse() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(
            cron.next_after(&at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap())
        );

        let with_seconds = CronSchedule::parse("*/30 * * * * *").unwrap();
        assert_eq!(
            with_seconds.next_after(&at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap())
        );

        assert!(CronSchedule::parse("not a cron").is_err());
    }

    #[test]
    fn test_spec_next_after() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let interval = ScheduleSpec::Interval(Duration::from_secs(10));
        assert_eq!(
            interval.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 10).unwrap())
        );

        let once = ScheduleSpec::Once(at);
        assert_eq!(once.next_after(at), None);
        assert_eq!(once.next_after(at - chrono::Duration::seconds(1)), Some(at));
        assert_eq!(interval.to_string(), "every 10s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_submits_each_tick() {
        let (store, _queue, scheduler) = scheduler();
        let id = scheduler
            .schedule_interval("cleanup", Duration::from_secs(10), empty(), ScheduleOptions::default())
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;

        let info = scheduler.get(id).unwrap();
        assert_eq!(info.run_count, 3);
        assert!(info.active);

        let jobs = store.list(&Default::default());
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|job| job.schedule_id == Some(id)));
        assert_eq!(info.last_job_id, Some(jobs[2].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_immediately() {
        let (store, _queue, scheduler) = scheduler();
        scheduler
            .schedule_interval(
                "cleanup",
                Duration::from_secs(60),
                empty(),
                ScheduleOptions::default().run_immediately(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_if_running() {
        let (store, _queue, scheduler) = scheduler();
        let id = scheduler
            .schedule_interval(
                "report",
                Duration::from_secs(10),
                empty(),
                ScheduleOptions::default().overlap(OverlapPolicy::SkipIfRunning),
            )
            .unwrap();

        // Nothing consumes the queue, so the first job stays Queued
        tokio::time::sleep(Duration::from_secs(35)).await;

        let info = scheduler.get(id).unwrap();
        assert_eq!(info.run_count, 1);
        assert_eq!(info.skipped_count, 2);
        assert_eq!(store.len(), 1);

        // Once the previous job is terminal the next tick submits again
        let previous = info.last_job_id.unwrap();
        store.begin_attempt(previous).unwrap();
        store.complete(previous).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.get(id).unwrap().run_count, 2);
        assert_eq!(store.counts().queued, 1);
        assert_eq!(store.get(previous).unwrap().state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let (store, _queue, scheduler) = scheduler();
        let id = scheduler
            .schedule_interval("cleanup", Duration::from_secs(10), empty(), ScheduleOptions::default())
            .unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        scheduler.cancel(id).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(store.len(), 1);
        assert!(scheduler.list().is_empty());
        assert_eq!(
            scheduler.cancel(id).unwrap_err().code(),
            ErrorCode::ScheduleNotFound
        );
    }

    #[tokio::test]
    async fn test_schedule_once_in_the_past_fires_immediately() {
        let (store, _queue, scheduler) = scheduler();
        let id = scheduler
            .schedule_once(
                "report",
                Utc::now() - chrono::Duration::seconds(5),
                empty(),
                ScheduleOptions::default().max_attempts(1),
            )
            .unwrap();

        while store.is_empty() {
            tokio::task::yield_now().await;
        }
        let job = &store.list(&Default::default())[0];
        assert_eq!(job.max_attempts, 1);

        // The task marks itself inactive once it has fired
        while scheduler.get(id).unwrap().active {
            tokio::task::yield_now().await;
        }
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.list().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_schedules_rejected() {
        let (_store, _queue, scheduler) = scheduler();

        let err = scheduler
            .schedule_interval("cleanup", Duration::ZERO, empty(), ScheduleOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSchedule);

        let err = scheduler
            .schedule_cron(" ", "0 * * * *", empty(), ScheduleOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSchedule);

        assert!(scheduler
            .schedule_cron("cleanup", "61 * * * *", empty(), ScheduleOptions::default())
            .is_err());
        assert!(scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_schedules() {
        let (_store, _queue, scheduler) = scheduler();
        scheduler
            .schedule_interval("cleanup", Duration::from_secs(1), empty(), ScheduleOptions::default())
            .unwrap();

        scheduler.shutdown().await;

        assert!(scheduler.list().iter().all(|info| !info.active));
        let err = scheduler
            .schedule_interval("cleanup", Duration::from_secs(1), empty(), ScheduleOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EngineNotRunning);
    }
}

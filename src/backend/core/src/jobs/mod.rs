//! Background job engine.
//!
//! This module provides an in-process job engine with:
//!
//! - **Submission**: One validated entry point that creates a record, then enqueues it
//! - **Queue**: FIFO queue with blocking dequeue and delayed (backoff) visibility
//! - **Workers**: N concurrent workers dispatching to registered handlers
//! - **Retry**: Deterministic exponential backoff up to a per-job attempt ceiling
//! - **Store**: Per-job state, attempts and an append-only transition history
//! - **Scheduler**: Interval, cron and one-shot periodic dispatch
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Job Engine                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │  Producer / │    │  Submitter  │    │    Queue    │    │   Worker    │  │
//! │  │  Scheduler  │───▶│ (validate,  │───▶│  (FIFO +    │───▶│    Pool     │  │
//! │  │             │    │   create)   │    │   delayed)  │    │  (N tasks)  │  │
//! │  └─────────────┘    └──────┬──────┘    └──────▲──────┘    └──────┬──────┘  │
//! │         ▲                  │                  │                  │         │
//! │         │                  ▼                  │ backoff          ▼         │
//! │         │           ┌─────────────┐    ┌──────┴──────┐    ┌─────────────┐  │
//! │         │           │  Job Store  │◀───│    Retry    │◀───│  Handlers   │  │
//! │         │           │  (records)  │    │ Controller  │    │  (registry) │  │
//! │         │           └─────────────┘    └─────────────┘    └──────┬──────┘  │
//! │         └────────────────────── follow-up jobs ─────────────────┘         │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use conveyor_core::jobs::{
//!     fixed_payload, handler_fn, payload, JobEngine, JobError, JobOutcome, Payload,
//!     ScheduleOptions,
//! };
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> conveyor_core::Result<()> {
//! let engine = JobEngine::builder()
//!     .workers(4)
//!     .handler("send_email", handler_fn(|ctx| async move {
//!         let to = ctx.str_field("email")?;
//!         ctx.log_info(&format!("sending to {}", to));
//!         Ok::<_, JobError>(JobOutcome::done())
//!     }))
//!     .handler("cleanup", handler_fn(|_ctx| async { Ok(JobOutcome::done()) }))
//!     .build()?;
//!
//! engine.start()?;
//! let id = engine.submit("send_email", payload(json!({"email": "a@b.com"})), Some(3))?;
//! let record = engine.get_status(id)?;
//! println!("{} is {:?}", id, record.state);
//!
//! engine.scheduler().schedule_interval(
//!     "cleanup",
//!     Duration::from_secs(3600),
//!     fixed_payload(Payload::new()),
//!     ScheduleOptions::default(),
//! )?;
//!
//! let report = engine.shutdown().await?;
//! assert!(report.graceful);
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod engine;
pub mod job;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod submit;
pub mod timer;
pub mod worker;

pub use builtin::{
    register_logging_builtins, CleanupHandler, Email, ImagePipelineHandler, ImageProcessor,
    ImageStep, LoggingImageProcessor, LoggingMailSender, LoggingRetentionStore, MailSender,
    RetentionStore, SendEmailHandler,
};
pub use engine::{EngineStats, JobEngine, JobEngineBuilder, ShutdownReport};
pub use job::{
    payload, FollowUp, HandlerResult, HistoryEntry, JobContext, JobError, JobId, JobOutcome,
    JobRecord, JobState, Payload,
};
pub use queue::{JobQueue, PromoteHook, QueueStats};
pub use retry::{BackoffStrategy, RetryController, RetryDecision, RetryPolicy};
pub use scheduler::{
    fixed_payload, CronSchedule, JobScheduler, OverlapPolicy, PayloadFactory, ScheduleId,
    ScheduleInfo, ScheduleOptions, ScheduleSpec,
};
pub use store::{JobFilter, JobStore, NewJob, StateCounts};
pub use submit::{JobSubmitter, SubmitRequest};
pub use timer::{DelayTimer, TimerId};
pub use worker::{
    blocking_fn, handler_fn, HandlerRegistry, JobHandler, WorkerConfig, WorkerHandle,
    WorkerPool, WorkerShutdown, WorkerStats, WorkerStatsSnapshot,
};

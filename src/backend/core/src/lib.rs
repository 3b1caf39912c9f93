#![allow(clippy::result_large_err)]
//! # Conveyor Core
//!
//! In-process background job engine.
//!
//! ## Architecture
//!
//! - **Jobs**: Submission, FIFO queue with delayed visibility, worker pool and job records
//! - **Retry**: Deterministic exponential backoff with a per-job attempt ceiling
//! - **Chaining**: Handlers return follow-up jobs submitted once they complete
//! - **Scheduler**: Interval, cron and one-shot periodic dispatch
//! - **Telemetry**: Structured logging and Prometheus metrics
//! - **Config**: Layered file and environment configuration

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ConveyorError, ErrorCode, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, EngineConfig, RetryConfig, ScheduleConfig};
    pub use crate::error::{ConveyorError, ErrorCode, ErrorDetails, ErrorSeverity, Result};
    pub use crate::jobs::{
        blocking_fn, handler_fn, payload, BackoffStrategy, FollowUp, HandlerRegistry,
        HandlerResult, JobContext, JobEngine, JobEngineBuilder, JobError, JobFilter, JobHandler,
        JobId, JobOutcome, JobRecord, JobState, OverlapPolicy, Payload, RetryPolicy,
        ScheduleOptions, ScheduleSpec, ShutdownReport, SubmitRequest,
    };
    pub use crate::telemetry::{init_telemetry, TelemetryConfig, TelemetryHandle};
}

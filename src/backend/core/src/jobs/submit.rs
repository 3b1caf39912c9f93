//! Submission API: the single entry point through which jobs are created.
//!
//! Producers, the periodic dispatcher and job chaining all go through
//! [`JobSubmitter`]; nothing else creates job records.

use std::sync::Arc;

use super::queue::JobQueue;
use super::scheduler::ScheduleId;
use super::store::{JobStore, NewJob};
use super::worker::HandlerRegistry;
use super::{FollowUp, JobId, Payload};
use crate::error::{ConveyorError, Result};
use crate::telemetry::metrics::JobMetrics;

/// A job submission with optional lineage metadata.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_type: String,
    pub payload: Payload,
    /// Falls back to the engine default when `None`
    pub max_attempts: Option<u32>,
    pub parent_id: Option<JobId>,
    pub correlation_id: Option<JobId>,
    pub schedule_id: Option<ScheduleId>,
}

impl SubmitRequest {
    pub fn new(job_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
            parent_id: None,
            correlation_id: None,
            schedule_id: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn correlation(mut self, correlation_id: JobId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

impl From<FollowUp> for SubmitRequest {
    fn from(follow_up: FollowUp) -> Self {
        Self {
            max_attempts: follow_up.max_attempts,
            ..Self::new(follow_up.job_type, follow_up.payload)
        }
    }
}

/// Validates submissions, creates their records and enqueues them.
#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    default_max_attempts: u32,
    reject_unknown_types: bool,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            default_max_attempts,
            reject_unknown_types: false,
        }
    }

    /// Reject job types without a registered handler at submission time
    /// instead of failing them on their first attempt.
    pub fn reject_unknown_types(mut self, reject: bool) -> Self {
        self.reject_unknown_types = reject;
        self
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts
    }

    /// Submit a job and return its id.
    ///
    /// # Errors
    ///
    /// - `InvalidJobType` for an empty or whitespace-only type
    /// - `InvalidMaxAttempts` when `max_attempts` is `Some(0)`
    /// - `UnknownJobType` for unregistered types when strict
    /// - `QueueClosed` after shutdown has begun
    ///
    /// No record is created when an error is returned.
    pub fn submit(
        &self,
        job_type: &str,
        payload: Payload,
        max_attempts: Option<u32>,
    ) -> Result<JobId> {
        let mut request = SubmitRequest::new(job_type, payload);
        request.max_attempts = max_attempts;
        self.submit_request(request)
    }

    pub fn submit_request(&self, request: SubmitRequest) -> Result<JobId> {
        let max_attempts = self.validate(&request)?;

        let record = self.queue.enqueue_with(|| {
            let record = self.store.create(NewJob {
                job_type: request.job_type,
                payload: request.payload,
                max_attempts,
                parent_id: request.parent_id,
                correlation_id: request.correlation_id,
                schedule_id: request.schedule_id,
            });
            (record.id, record)
        })?;

        JobMetrics::submitted(&record.job_type);
        tracing::debug!(
            job_id = %record.id,
            job_type = %record.job_type,
            max_attempts,
            parent_id = ?record.parent_id,
            "Job submitted"
        );

        Ok(record.id)
    }

    fn validate(&self, request: &SubmitRequest) -> Result<u32> {
        if request.job_type.trim().is_empty() {
            return Err(ConveyorError::invalid_job_type(&request.job_type));
        }

        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(ConveyorError::invalid_max_attempts(max_attempts));
        }

        if self.reject_unknown_types && !self.registry.contains(&request.job_type) {
            return Err(ConveyorError::unknown_job_type(request.job_type.as_str()));
        }

        Ok(max_attempts)
    }
}

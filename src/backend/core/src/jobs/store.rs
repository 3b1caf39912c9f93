//! In-memory job record store.
//!
//! Each record lives behind its own mutex inside a [`DashMap`], so every
//! mutation of one job id is serialized while different ids proceed in
//! parallel. Readers receive a cloned snapshot taken under the same lock and
//! never observe a partially applied transition.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::scheduler::ScheduleId;
use super::{HistoryEntry, JobId, JobRecord, JobState, Payload};
use crate::error::{ConveyorError, Result};

/// Parameters for creating a record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Payload,
    pub max_attempts: u32,
    pub parent_id: Option<JobId>,
    pub correlation_id: Option<JobId>,
    pub schedule_id: Option<ScheduleId>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Payload, max_attempts: u32) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts,
            parent_id: None,
            correlation_id: None,
            schedule_id: None,
        }
    }
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub correlation_id: Option<JobId>,
}

impl JobFilter {
    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn correlation(mut self, correlation_id: JobId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    fn matches(&self, record: &JobRecord) -> bool {
        self.state.map_or(true, |s| record.state == s)
            && self
                .job_type
                .as_deref()
                .map_or(true, |t| record.job_type == t)
            && self
                .correlation_id
                .map_or(true, |c| record.correlation_id == c)
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub queued: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.retrying + self.completed + self.failed
    }

    /// Jobs that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.queued + self.running + self.retrying
    }

    fn bump(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Running => self.running += 1,
            JobState::Retrying => self.retrying += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

/// Concurrency-safe store of job records.
#[derive(Default)]
pub struct JobStore {
    records: DashMap<JobId, Arc<Mutex<JobRecord>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record in `Queued` with zero attempts.
    pub fn create(&self, new_job: NewJob) -> JobRecord {
        let now = Utc::now();
        let id = JobId::new();

        let record = JobRecord {
            id,
            job_type: new_job.job_type,
            payload: new_job.payload,
            max_attempts: new_job.max_attempts,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            history: vec![HistoryEntry {
                at: now,
                state: JobState::Queued,
                message: Some("submitted".to_string()),
            }],
            created_at: now,
            updated_at: now,
            parent_id: new_job.parent_id,
            correlation_id: new_job.correlation_id.unwrap_or(id),
            schedule_id: new_job.schedule_id,
        };

        self.records
            .insert(id, Arc::new(Mutex::new(record.clone())));
        record
    }

    /// Snapshot of a record.
    pub fn get(&self, id: JobId) -> Result<JobRecord> {
        let entry = self.entry(id)?;
        let record = entry.lock().clone();
        Ok(record)
    }

    /// Apply a state transition and append its history entry.
    pub fn update(&self, id: JobId, state: JobState, message: Option<&str>) -> Result<JobRecord> {
        self.mutate(id, |record| {
            transition(record, state, message.map(str::to_string))
        })
    }

    /// `Queued -> Running`, counting one more attempt.
    pub fn begin_attempt(&self, id: JobId) -> Result<JobRecord> {
        self.mutate(id, |record| {
            if record.attempts >= record.max_attempts {
                return Err(ConveyorError::attempts_exhausted(
                    record.id,
                    record.max_attempts,
                ));
            }
            let message = format!("attempt {} of {}", record.attempts + 1, record.max_attempts);
            transition(record, JobState::Running, Some(message))?;
            record.attempts += 1;
            Ok(())
        })
    }

    /// `Running -> Completed`.
    pub fn complete(&self, id: JobId) -> Result<JobRecord> {
        self.mutate(id, |record| transition(record, JobState::Completed, None))
    }

    /// `Running -> Retrying`, recording the failure.
    pub fn schedule_retry(&self, id: JobId, error: &str, delay: Duration) -> Result<JobRecord> {
        self.mutate(id, |record| {
            let message = format!("{} (retry in {}ms)", error, delay.as_millis());
            transition(record, JobState::Retrying, Some(message))?;
            record.last_error = Some(error.to_string());
            Ok(())
        })
    }

    /// `Running -> Failed`, recording the failure.
    pub fn fail(&self, id: JobId, error: &str, reason: &str) -> Result<JobRecord> {
        self.mutate(id, |record| {
            transition(record, JobState::Failed, Some(reason.to_string()))?;
            record.last_error = Some(error.to_string());
            Ok(())
        })
    }

    /// `Retrying -> Queued`, once the backoff delay has elapsed.
    pub fn requeue(&self, id: JobId) -> Result<JobRecord> {
        self.mutate(id, |record| {
            transition(record, JobState::Queued, Some("backoff elapsed".to_string()))
        })
    }

    /// Snapshots of all records matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().lock().clone())
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.records.iter() {
            counts.bump(entry.value().lock().state);
        }
        counts
    }

    /// Whether the job exists and has not reached a terminal state.
    pub fn is_in_flight(&self, id: JobId) -> bool {
        self.records
            .get(&id)
            .map(|entry| !entry.value().lock().state.is_terminal())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn entry(&self, id: JobId) -> Result<Arc<Mutex<JobRecord>>> {
        self.records
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConveyorError::job_not_found(id))
    }

    // The dashmap shard guard is released before the record lock is taken.
    fn mutate<F>(&self, id: JobId, f: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()>,
    {
        let entry = self.entry(id)?;
        let mut record = entry.lock();
        f(&mut record)?;
        Ok(record.clone())
    }
}

fn transition(record: &mut JobRecord, next: JobState, message: Option<String>) -> Result<()> {
    if !record.state.can_transition_to(next) {
        return Err(ConveyorError::invalid_state_transition(
            record.id,
            record.state,
            next,
        ));
    }

    let now = Utc::now();
    record.state = next;
    record.updated_at = now;
    record.history.push(HistoryEntry {
        at: now,
        state: next,
        message,
    });
    Ok(())
}

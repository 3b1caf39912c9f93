//! Job definitions.
//!
//! This module provides the core data model of the engine:
//!
//! - **JobId**: Unique identifier assigned at submission
//! - **JobState**: The job state machine and its legal edges
//! - **JobRecord**: Mutable status, attempts and transition history of a job
//! - **JobError / JobOutcome**: What a handler reports back to the worker
//! - **JobContext**: The view of a job handed to its handler

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::scheduler::ScheduleId;

/// Opaque key-value payload passed to handlers.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// State of a job.
///
/// ```text
/// Queued ──▶ Running ──▶ Completed
///   ▲           │
///   │           ├──────▶ Failed
///   │           ▼
///   └─────── Retrying
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue for a worker
    Queued,
    /// Owned by a worker, handler is executing
    Running,
    /// Failed an attempt, waiting for its backoff delay to elapse
    Retrying,
    /// Handler succeeded
    Completed,
    /// Failed permanently
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Queued,
        Self::Running,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Retrying)
                | (Self::Running, Self::Failed)
                | (Self::Retrying, Self::Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// Failure reported when no handler is registered for a job type.
    pub fn missing_handler(job_type: &str) -> Self {
        Self::fatal(format!("no handler registered for job type '{}'", job_type))
            .with_code("MISSING_HANDLER")
    }

    /// Failure reported when a handler panics.
    pub fn panicked(detail: impl Into<String>) -> Self {
        Self::retryable(format!("handler panicked: {}", detail.into())).with_code("PANIC")
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::retryable(message)
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::fatal(format!("invalid payload: {}", error)).with_code("INVALID_PAYLOAD")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// A dependent job to submit once the current job has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub job_type: String,
    pub payload: Payload,
    pub max_attempts: Option<u32>,
}

impl FollowUp {
    pub fn new(job_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Successful result of a handler invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    /// Jobs to chain after this one is marked completed
    pub follow_ups: Vec<FollowUp>,
}

impl JobOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    /// Chain a follow-on job.
    pub fn then(mut self, follow_up: FollowUp) -> Self {
        self.follow_ups.push(follow_up);
        self
    }
}

/// Result type for handler execution.
pub type HandlerResult = std::result::Result<JobOutcome, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// One transition in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub state: JobState,
    pub message: Option<String>,
}

/// Status and history of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier
    pub id: JobId,
    /// Job type name, selects the handler
    pub job_type: String,
    /// Handler input
    pub payload: Payload,
    /// Ceiling on execution attempts
    pub max_attempts: u32,
    /// Current state
    pub state: JobState,
    /// Number of execution starts so far
    pub attempts: u32,
    /// Message of the most recent failed attempt
    pub last_error: Option<String>,
    /// Append-only transition log
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Job whose success chained this one
    pub parent_id: Option<JobId>,
    /// Root of the chain this job belongs to
    pub correlation_id: JobId,
    /// Periodic schedule that produced this job
    pub schedule_id: Option<ScheduleId>,
}

impl JobRecord {
    /// Timestamp of the first history entry in `state`, if any.
    pub fn entered_at(&self, state: JobState) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|entry| entry.state == state)
            .map(|entry| entry.at)
    }

    /// Wall-clock time between creation and the terminal transition.
    pub fn duration(&self) -> Option<chrono::Duration> {
        if self.state.is_terminal() {
            Some(self.updated_at - self.created_at)
        } else {
            None
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: Payload,
    /// Current attempt number (1-indexed)
    pub attempt: u32,
    pub max_attempts: u32,
    pub correlation_id: JobId,
}

impl JobContext {
    pub(crate) fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            payload: record.payload.clone(),
            attempt: record.attempts,
            max_attempts: record.max_attempts,
            correlation_id: record.correlation_id,
        }
    }

    /// Whether this is the last attempt the retry policy allows.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Get a string field from the payload.
    pub fn str_field(&self, key: &str) -> Result<&str, JobError> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                JobError::fatal(format!("payload field '{}' missing or not a string", key))
                    .with_code("INVALID_PAYLOAD")
            })
    }

    /// Deserialize the whole payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.payload.clone(),
        ))?)
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            attempt = self.attempt,
            message
        );
    }
}

/// Build a [`Payload`] from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty payload.
pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let uuid = Uuid::new_v4();
        let id = JobId::from_uuid(uuid);
        assert_eq!(id.0, uuid);

        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[test]
    fn test_state_machine_edges() {
        use JobState::*;

        let allowed = [
            (Queued, Running),
            (Running, Completed),
            (Running, Retrying),
            (Running, Failed),
            (Retrying, Queued),
        ];

        for from in JobState::ALL {
            for to in JobState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in JobState::ALL {
            assert!(!JobState::Completed.can_transition_to(to));
            assert!(!JobState::Failed.can_transition_to(to));
        }
    }

    #[test]
    fn test_job_error() {
        let error = JobError::retryable("network timeout")
            .with_code("TIMEOUT")
            .with_context(json!({"attempt": 3}));

        assert!(error.retryable);
        assert_eq!(error.code, Some("TIMEOUT".to_string()));
        assert!(error.context.is_some());
        assert_eq!(error.to_string(), "network timeout (code: TIMEOUT)");

        let missing = JobError::missing_handler("bogus_type");
        assert!(!missing.retryable);
        assert!(missing.message.contains("bogus_type"));
    }

    #[test]
    fn test_outcome_chaining() {
        let outcome = JobOutcome::done()
            .then(FollowUp::new("watermark", payload(json!({"path": "a.png"}))))
            .then(FollowUp::new("thumbnail", Payload::new()).with_max_attempts(2));

        assert_eq!(outcome.follow_ups.len(), 2);
        assert_eq!(outcome.follow_ups[0].job_type, "watermark");
        assert_eq!(outcome.follow_ups[1].max_attempts, Some(2));
    }

    #[test]
    fn test_context_payload_access() {
        #[derive(Deserialize)]
        struct Email {
            email: String,
        }

        let ctx = JobContext {
            job_id: JobId::new(),
            job_type: "send_email".to_string(),
            payload: payload(json!({"email": "a@b.com", "count": 2})),
            attempt: 1,
            max_attempts: 3,
            correlation_id: JobId::new(),
        };

        assert_eq!(ctx.str_field("email").unwrap(), "a@b.com");
        assert!(ctx.str_field("count").is_err());
        assert!(!ctx.str_field("missing").unwrap_err().retryable);

        let typed: Email = ctx.payload_as().unwrap();
        assert_eq!(typed.email, "a@b.com");
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_payload_helper() {
        assert_eq!(payload(json!({"a": 1})).len(), 1);
        assert!(payload(json!([1, 2])).is_empty());
    }
}

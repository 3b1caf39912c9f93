//! Error handling for Conveyor Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and chained sources
//! - User-facing messages vs detailed internal messages
//! - Severity classification driving log levels
//! - Metrics integration for error tracking
//!
//! Handler failures are *not* represented here: a handler reports failure
//! with [`crate::jobs::JobError`], which the retry controller consumes.
//! `ConveyorError` is returned by engine operations (submission, queries,
//! scheduling, configuration).
//!
//! # Usage
//!
//! ```rust
//! use conveyor_core::error::{ConveyorError, ErrorCode, Result};
//!
//! fn require_type(job_type: &str) -> Result<&str> {
//!     if job_type.trim().is_empty() {
//!         return Err(ConveyorError::invalid_job_type(job_type));
//!     }
//!     Ok(job_type)
//! }
//!
//! assert_eq!(require_type("").unwrap_err().code(), ErrorCode::InvalidJobType);
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Submission Errors (1000-1099)
    InvalidJobType,
    InvalidMaxAttempts,
    UnknownJobType,

    // Job Store Errors (1100-1199)
    JobNotFound,
    InvalidStateTransition,
    AttemptsExhausted,

    // Queue / Engine Errors (1200-1299)
    QueueClosed,
    EngineNotRunning,
    EngineAlreadyRunning,

    // Scheduling Errors (1300-1399)
    InvalidSchedule,
    ScheduleNotFound,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidJobType => 1000,
            Self::InvalidMaxAttempts => 1001,
            Self::UnknownJobType => 1002,

            Self::JobNotFound => 1100,
            Self::InvalidStateTransition => 1101,
            Self::AttemptsExhausted => 1102,

            Self::QueueClosed => 1200,
            Self::EngineNotRunning => 1201,
            Self::EngineAlreadyRunning => 1202,

            Self::InvalidSchedule => 1300,
            Self::ScheduleNotFound => 1301,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "submission",
            1100..=1199 => "store",
            1200..=1299 => "engine",
            1300..=1399 => "scheduling",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (engine state, timeouts)
    Medium,
    /// System errors (serialization, configuration)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidJobType
            | ErrorCode::InvalidMaxAttempts
            | ErrorCode::UnknownJobType
            | ErrorCode::JobNotFound
            | ErrorCode::ScheduleNotFound
            | ErrorCode::InvalidSchedule => Self::Low,

            ErrorCode::InvalidStateTransition
            | ErrorCode::AttemptsExhausted
            | ErrorCode::QueueClosed
            | ErrorCode::EngineNotRunning
            | ErrorCode::EngineAlreadyRunning => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, schedule)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Conveyor Core.
#[derive(Error, Debug)]
pub struct ConveyorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConveyorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConveyorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration is invalid",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "conveyor_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ConveyorError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON payload", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for ConveyorError {
    fn from(error: std::io::Error) -> Self {
        let (code, user_msg) = match error.kind() {
            std::io::ErrorKind::NotFound => {
                (ErrorCode::MissingConfiguration, "File or resource not found")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for ConveyorError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ConveyorError>() {
            Ok(conveyor_error) => conveyor_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ConveyorError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

impl From<cron::error::Error> for ConveyorError {
    fn from(error: cron::error::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidSchedule,
            "Cron expression is invalid",
            error.to_string(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConveyorError {
    /// Submission with an empty or blank job type.
    pub fn invalid_job_type(job_type: &str) -> Self {
        Self::new(
            ErrorCode::InvalidJobType,
            format!("Job type must be a non-empty string, got {:?}", job_type),
        )
    }

    /// Submission with `max_attempts == 0`.
    pub fn invalid_max_attempts(max_attempts: u32) -> Self {
        Self::new(
            ErrorCode::InvalidMaxAttempts,
            format!("max_attempts must be at least 1, got {}", max_attempts),
        )
    }

    /// Submission for a type with no registered handler (strict mode only).
    pub fn unknown_job_type(job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self::new(
            ErrorCode::UnknownJobType,
            format!("No handler registered for job type '{}'", job_type),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job_type", &job_type)
                .with_suggestion("Register a handler before submitting jobs of this type"),
        )
    }

    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    pub fn invalid_state_transition(
        job_id: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Job {} cannot transition from {} to {}", job_id, from, to),
        )
    }

    pub fn attempts_exhausted(job_id: impl fmt::Display, max_attempts: u32) -> Self {
        Self::new(
            ErrorCode::AttemptsExhausted,
            format!("Job {} already used all {} attempts", job_id, max_attempts),
        )
    }

    pub fn queue_closed() -> Self {
        Self::new(ErrorCode::QueueClosed, "Job queue is closed")
    }

    pub fn engine_not_running() -> Self {
        Self::new(ErrorCode::EngineNotRunning, "Job engine is not running")
    }

    pub fn engine_already_running() -> Self {
        Self::new(ErrorCode::EngineAlreadyRunning, "Job engine is already running")
    }

    pub fn invalid_schedule(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSchedule, message.into())
    }

    pub fn schedule_not_found(schedule_id: impl fmt::Display) -> Self {
        let id = schedule_id.to_string();
        Self::new(ErrorCode::ScheduleNotFound, format!("Schedule not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("schedule", id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::InvalidJobType.category(), "submission");
        assert_eq!(ErrorCode::JobNotFound.category(), "store");
        assert_eq!(ErrorCode::QueueClosed.category(), "engine");
        assert_eq!(ErrorCode::InvalidSchedule.category(), "scheduling");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_job_not_found_details() {
        let error = ConveyorError::job_not_found("abc-123");
        assert_eq!(error.code(), ErrorCode::JobNotFound);
        assert_eq!(error.details().entity_type.as_deref(), Some("job"));
        assert_eq!(error.details().entity_id.as_deref(), Some("abc-123"));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_error_context() {
        let error = ConveyorError::new(ErrorCode::InvalidJobType, "bad type")
            .with_context("field", "job_type")
            .with_context("reason", "empty");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("reason"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: ConveyorError = parse.unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn test_error_display() {
        let error = ConveyorError::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration is invalid",
            "engine.workers must be > 0",
        );

        let display = format!("{}", error);
        assert!(display.contains("InvalidConfiguration"));
        assert!(display.contains("Configuration is invalid"));
        assert!(display.contains("engine.workers"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InvalidJobType),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::QueueClosed),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InvalidConfiguration),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InternalError),
            ErrorSeverity::Critical
        );
    }
}

//! Built-in handlers.
//!
//! Handlers here never perform side effects themselves; they validate the
//! payload and delegate to a one-method port supplied by the host:
//!
//! - **send_email**: [`MailSender`]
//! - **resize / watermark / thumbnail**: [`ImageProcessor`], chained
//! - **cleanup**: [`RetentionStore`]
//!
//! The `Logging*` port implementations only log and are what the
//! `conveyor-server` binary wires in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;

use super::worker::{HandlerRegistry, JobHandler};
use super::{payload, FollowUp, HandlerResult, JobContext, JobError, JobOutcome};

// ═══════════════════════════════════════════════════════════════════════════════
// Ports
// ═══════════════════════════════════════════════════════════════════════════════

/// An outgoing email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailSender: Send + Sync + 'static {
    async fn send(&self, email: &Email) -> Result<(), JobError>;
}

/// One stage of the image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStep {
    Resize,
    Watermark,
    Thumbnail,
}

impl ImageStep {
    pub const ALL: [ImageStep; 3] = [Self::Resize, Self::Watermark, Self::Thumbnail];

    /// Job type the step is registered under.
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Watermark => "watermark",
            Self::Thumbnail => "thumbnail",
        }
    }

    pub fn from_job_type(job_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.job_type() == job_type)
    }

    /// The step chained after this one.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Resize => Some(Self::Watermark),
            Self::Watermark => Some(Self::Thumbnail),
            Self::Thumbnail => None,
        }
    }
}

impl fmt::Display for ImageStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_type())
    }
}

#[async_trait]
pub trait ImageProcessor: Send + Sync + 'static {
    /// Apply `step` to the image at `path`, returning the output path.
    async fn apply(&self, step: ImageStep, path: &str) -> Result<String, JobError>;
}

#[async_trait]
pub trait RetentionStore: Send + Sync + 'static {
    /// Remove entries older than `cutoff`, returning how many were removed.
    async fn purge_older_than(&self, target: &str, cutoff: DateTime<Utc>) -> Result<u64, JobError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

const DEFAULT_SUBJECT: &str = "Welcome";
const DEFAULT_BODY: &str = "Thanks for signing up.";

/// Sends the email described by `{"email", "subject"?, "body"?}`.
pub struct SendEmailHandler<M> {
    sender: Arc<M>,
}

impl<M: MailSender> SendEmailHandler<M> {
    pub const JOB_TYPE: &'static str = "send_email";

    pub fn new(sender: Arc<M>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<M: MailSender> JobHandler for SendEmailHandler<M> {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let to = ctx.str_field("email")?;
        if !to.contains('@') {
            return Err(JobError::fatal(format!("invalid email address '{}'", to))
                .with_code("INVALID_PAYLOAD"));
        }

        let email = Email {
            to: to.to_string(),
            subject: ctx.str_field("subject").unwrap_or(DEFAULT_SUBJECT).to_string(),
            body: ctx.str_field("body").unwrap_or(DEFAULT_BODY).to_string(),
        };

        self.sender.send(&email).await?;
        ctx.log_info("Email sent");
        Ok(JobOutcome::done())
    }
}

/// Runs one image step and chains the next one with the produced path.
pub struct ImagePipelineHandler<P> {
    processor: Arc<P>,
}

impl<P: ImageProcessor> ImagePipelineHandler<P> {
    pub fn new(processor: Arc<P>) -> Self {
        Self { processor }
    }

    /// Register one shared handler under every step's job type.
    pub fn register(processor: Arc<P>, registry: &mut HandlerRegistry) {
        let handler: Arc<dyn JobHandler> = Arc::new(Self::new(processor));
        for step in ImageStep::ALL {
            registry.register_arc(step.job_type(), handler.clone());
        }
    }
}

#[async_trait]
impl<P: ImageProcessor> JobHandler for ImagePipelineHandler<P> {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let step = ImageStep::from_job_type(&ctx.job_type).ok_or_else(|| {
            JobError::fatal(format!("'{}' is not an image step", ctx.job_type))
        })?;
        let path = ctx.str_field("path")?;

        let output = self.processor.apply(step, path).await?;
        tracing::debug!(job_id = %ctx.job_id, step = %step, input = path, output = %output, "Image step applied");

        let outcome = match step.next() {
            Some(next) => JobOutcome::done().then(FollowUp::new(
                next.job_type(),
                payload(json!({ "path": output, "source": path })),
            )),
            None => JobOutcome::done(),
        };
        Ok(outcome)
    }
}

/// Periodic retention sweep over `{"target"?, "retention_days"?}`.
pub struct CleanupHandler<R> {
    store: Arc<R>,
    default_retention_days: i64,
}

impl<R: RetentionStore> CleanupHandler<R> {
    pub const JOB_TYPE: &'static str = "cleanup";

    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            default_retention_days: 30,
        }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.default_retention_days = days;
        self
    }
}

#[async_trait]
impl<R: RetentionStore> JobHandler for CleanupHandler<R> {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let target = ctx.str_field("target").unwrap_or("logs");
        let days = match ctx.payload.get("retention_days") {
            None => self.default_retention_days,
            Some(value) => value.as_i64().filter(|d| *d >= 0).ok_or_else(|| {
                JobError::fatal("retention_days must be a non-negative integer")
                    .with_code("INVALID_PAYLOAD")
            })?,
        };

        let cutoff = chrono::Duration::try_days(days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                JobError::fatal(format!("retention_days {} is out of range", days))
                    .with_code("INVALID_PAYLOAD")
            })?;
        let removed = self.store.purge_older_than(target, cutoff).await?;

        tracing::info!(
            job_id = %ctx.job_id,
            sweep_target = target,
            retention_days = days,
            removed,
            "Retention sweep finished"
        );
        Ok(JobOutcome::done())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Logging ports
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct LoggingMailSender;

#[async_trait]
impl MailSender for LoggingMailSender {
    async fn send(&self, email: &Email) -> Result<(), JobError> {
        tracing::info!(to = %email.to, subject = %email.subject, "Sending email");
        Ok(())
    }
}

/// Appends the step name to the file stem: `a.png` -> `a_resize.png`.
#[derive(Debug, Default)]
pub struct LoggingImageProcessor;

#[async_trait]
impl ImageProcessor for LoggingImageProcessor {
    async fn apply(&self, step: ImageStep, path: &str) -> Result<String, JobError> {
        let output = match path.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, step, ext),
            _ => format!("{}_{}", path, step),
        };
        tracing::info!(step = %step, input = path, output = %output, "Processing image");
        Ok(output)
    }
}

#[derive(Debug, Default)]
pub struct LoggingRetentionStore;

#[async_trait]
impl RetentionStore for LoggingRetentionStore {
    async fn purge_older_than(&self, target: &str, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        tracing::info!(sweep_target = target, cutoff = %cutoff, "Purging expired entries");
        Ok(0)
    }
}

/// Register every built-in handler backed by the logging ports.
pub fn register_logging_builtins(registry: &mut HandlerRegistry) {
    registry.register(
        SendEmailHandler::<LoggingMailSender>::JOB_TYPE,
        SendEmailHandler::new(Arc::new(LoggingMailSender)),
    );
    ImagePipelineHandler::register(Arc::new(LoggingImageProcessor), registry);
    registry.register(
        CleanupHandler::<LoggingRetentionStore>::JOB_TYPE,
        CleanupHandler::new(Arc::new(LoggingRetentionStore)),
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, Payload};
    use parking_lot::Mutex;

    fn ctx(job_type: &str, payload: Payload) -> JobContext {
        let id = JobId::new();
        JobContext {
            job_id: id,
            job_type: job_type.to_string(),
            payload,
            attempt: 1,
            max_attempts: 3,
            correlation_id: id,
        }
    }

    #[derive(Default)]
    struct RecordingMail {
        sent: Mutex<Vec<Email>>,
    }

    #[async_trait]
    impl MailSender for RecordingMail {
        async fn send(&self, email: &Email) -> Result<(), JobError> {
            self.sent.lock().push(email.clone());
            Ok(())
        }
    }

    struct FlakyMail;

    #[async_trait]
    impl MailSender for FlakyMail {
        async fn send(&self, _email: &Email) -> Result<(), JobError> {
            Err(JobError::retryable("smtp unavailable"))
        }
    }

    #[tokio::test]
    async fn test_send_email_defaults() {
        let mail = Arc::new(RecordingMail::default());
        let handler = SendEmailHandler::new(mail.clone());

        let outcome = handler
            .handle(ctx("send_email", payload(json!({"email": "a@b.com"}))))
            .await
            .unwrap();
        assert!(outcome.follow_ups.is_empty());

        let sent = mail.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b.com");
        assert_eq!(sent[0].subject, DEFAULT_SUBJECT);
    }

    #[tokio::test]
    async fn test_send_email_payload_errors_are_fatal() {
        let handler = SendEmailHandler::new(Arc::new(RecordingMail::default()));

        let missing = handler.handle(ctx("send_email", Payload::new())).await.unwrap_err();
        assert!(!missing.retryable);

        let invalid = handler
            .handle(ctx("send_email", payload(json!({"email": "nobody"}))))
            .await
            .unwrap_err();
        assert!(!invalid.retryable);
        assert_eq!(invalid.code.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[tokio::test]
    async fn test_send_email_port_failure_is_retryable() {
        let handler = SendEmailHandler::new(Arc::new(FlakyMail));
        let err = handler
            .handle(ctx("send_email", payload(json!({"email": "a@b.com"}))))
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.message, "smtp unavailable");
    }

    #[test]
    fn test_image_steps() {
        assert_eq!(ImageStep::from_job_type("watermark"), Some(ImageStep::Watermark));
        assert_eq!(ImageStep::from_job_type("crop"), None);
        assert_eq!(ImageStep::Resize.next(), Some(ImageStep::Watermark));
        assert_eq!(ImageStep::Thumbnail.next(), None);
    }

    #[tokio::test]
    async fn test_image_pipeline_chains_next_step() {
        let handler = ImagePipelineHandler::new(Arc::new(LoggingImageProcessor));

        let outcome = handler
            .handle(ctx("resize", payload(json!({"path": "photos/cat.png"}))))
            .await
            .unwrap();
        assert_eq!(outcome.follow_ups.len(), 1);
        let next = &outcome.follow_ups[0];
        assert_eq!(next.job_type, "watermark");
        assert_eq!(next.payload["path"], "photos/cat_resize.png");

        let last = handler
            .handle(ctx("thumbnail", payload(json!({"path": "cat_resize_watermark.png"}))))
            .await
            .unwrap();
        assert!(last.follow_ups.is_empty());
    }

    #[tokio::test]
    async fn test_image_pipeline_rejects_unknown_step() {
        let handler = ImagePipelineHandler::new(Arc::new(LoggingImageProcessor));
        let err = handler
            .handle(ctx("crop", payload(json!({"path": "a.png"}))))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[derive(Default)]
    struct RecordingRetention {
        calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl RetentionStore for RecordingRetention {
        async fn purge_older_than(&self, target: &str, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
            self.calls.lock().push((target.to_string(), cutoff));
            Ok(7)
        }
    }

    #[tokio::test]
    async fn test_cleanup_uses_retention_window() {
        let store = Arc::new(RecordingRetention::default());
        let handler = CleanupHandler::new(store.clone()).with_retention_days(10);

        handler.handle(ctx("cleanup", Payload::new())).await.unwrap();
        handler
            .handle(ctx("cleanup", payload(json!({"target": "sessions", "retention_days": 1}))))
            .await
            .unwrap();

        let calls = store.calls.lock();
        assert_eq!(calls[0].0, "logs");
        assert_eq!(calls[1].0, "sessions");
        let age = Utc::now() - calls[0].1;
        assert!(age >= chrono::Duration::days(10));
        assert!(calls[1].1 > calls[0].1);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_negative_retention() {
        let handler = CleanupHandler::new(Arc::new(RecordingRetention::default()));
        let err = handler
            .handle(ctx("cleanup", payload(json!({"retention_days": -1}))))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_out_of_range_retention() {
        let store = Arc::new(RecordingRetention::default());
        let handler = CleanupHandler::new(store.clone());
        let err = handler
            .handle(ctx("cleanup", payload(json!({"retention_days": 1_000_000_000_i64}))))
            .await
            .unwrap_err();

        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("INVALID_PAYLOAD"));
        assert!(store.calls.lock().is_empty());
    }

    #[test]
    fn test_register_logging_builtins() {
        let mut registry = HandlerRegistry::new();
        register_logging_builtins(&mut registry);
        assert_eq!(
            registry.job_types(),
            vec!["cleanup", "resize", "send_email", "thumbnail", "watermark"]
        );
    }
}

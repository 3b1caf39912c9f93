//! Prometheus metrics for job throughput, latency and engine health.
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::started("send_email");
//! JobMetrics::finished("send_email", 0.125, true);
//! JobMetrics::completed("send_email");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address of the Prometheus scrape endpoint (e.g. "0.0.0.0:9090");
    /// without it metrics are only rendered in-process
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
    ]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// With `listen` set, the exporter serves `/metrics` on that address and
/// must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let registry = match config.listen {
        Some(addr) => {
            builder.with_http_listener(addr).install()?;
            MetricsRegistry::disabled()
        }
        None => MetricsRegistry {
            prometheus_handle: Some(builder.install_recorder()?),
        },
    };

    register_metrics();

    tracing::info!(
        service_name = %service_name,
        listen = ?config.listen,
        "Metrics initialized"
    );

    Ok(registry)
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!("conveyor_jobs_submitted_total", "Jobs accepted by the submission API");
    describe_counter!("conveyor_jobs_started_total", "Job attempts started");
    describe_counter!("conveyor_jobs_completed_total", "Jobs that completed successfully");
    describe_counter!("conveyor_jobs_retried_total", "Failed attempts scheduled for retry");
    describe_counter!("conveyor_jobs_failed_total", "Jobs that failed permanently");
    describe_histogram!(
        "conveyor_job_duration_seconds",
        "Handler execution time per attempt in seconds"
    );
    describe_gauge!("conveyor_jobs_in_flight", "Handlers currently executing");
    describe_gauge!("conveyor_queue_depth", "Jobs ready in the queue");
    describe_counter!("conveyor_schedule_ticks_total", "Periodic schedule ticks");
    describe_counter!("conveyor_errors_total", "Engine errors by code");
}

/// Per-event job metrics, labelled by job type.
pub struct JobMetrics;

impl JobMetrics {
    pub fn submitted(job_type: &str) {
        counter!("conveyor_jobs_submitted_total", "job_type" => job_type.to_string()).increment(1);
    }

    /// Record an attempt start; pairs with [`JobMetrics::finished`].
    pub fn started(job_type: &str) {
        counter!("conveyor_jobs_started_total", "job_type" => job_type.to_string()).increment(1);
        gauge!("conveyor_jobs_in_flight").increment(1.0);
    }

    /// Record the end of an attempt, whatever its outcome.
    pub fn finished(job_type: &str, duration_seconds: f64, success: bool) {
        gauge!("conveyor_jobs_in_flight").decrement(1.0);
        histogram!(
            "conveyor_job_duration_seconds",
            "job_type" => job_type.to_string(),
            "success" => success.to_string(),
        )
        .record(duration_seconds);
    }

    pub fn completed(job_type: &str) {
        counter!("conveyor_jobs_completed_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn retried(job_type: &str) {
        counter!("conveyor_jobs_retried_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn failed(job_type: &str, retryable: bool) {
        counter!(
            "conveyor_jobs_failed_total",
            "job_type" => job_type.to_string(),
            "retryable" => retryable.to_string(),
        )
        .increment(1);
    }

    pub fn set_queue_depth(depth: usize) {
        gauge!("conveyor_queue_depth").set(depth as f64);
    }

    pub fn schedule_tick(schedule: &str, submitted: bool) {
        counter!(
            "conveyor_schedule_ticks_total",
            "schedule" => schedule.to_string(),
            "submitted" => submitted.to_string(),
        )
        .increment(1);
    }
}

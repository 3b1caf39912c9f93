//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: `tracing` events rendered as JSON, pretty or compact text
//! - **Metrics**: job counters, durations and queue depth via the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::default();
//! let handle = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{init_metrics, register_metrics, JobMetrics, MetricsConfig, MetricsRegistry};

/// Logging and metrics settings, as loaded from the `logging` and `metrics`
/// configuration sections.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every metric
    pub service_name: String,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "conveyor".to_string(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Initialize logging and metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    init_logging(&config.logging)?;
    let metrics = init_metrics(&config.metrics, &config.service_name)?;

    Ok(TelemetryHandle { metrics })
}

/// Handle for managing telemetry lifecycle.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::info!("Telemetry shutdown complete");
    }
}

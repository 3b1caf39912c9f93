//! Configuration management.
//!
//! Values are layered from an optional file (TOML, YAML or JSON, picked by
//! extension) and `CONVEYOR__<SECTION>__<KEY>` environment variables, the
//! latter taking precedence. Durations are written in humantime form
//! (`"250ms"`, `"10s"`, `"1h"`).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConveyorError, Result};
use crate::jobs::retry::{BackoffStrategy, RetryPolicy};
use crate::jobs::scheduler::OverlapPolicy;
use crate::jobs::worker::WorkerConfig;
use crate::jobs::Payload;
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry backoff configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Periodic schedules registered at startup
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Engine name, used as the worker name prefix and metrics service label
    #[serde(default = "default_name")]
    pub name: String,

    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempt ceiling for jobs submitted without one
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// How long shutdown waits for running handlers before aborting them
    #[serde(default = "default_shutdown_grace_period", with = "humantime_serde")]
    pub shutdown_grace_period: Duration,

    /// Reject unregistered job types at submission instead of failing them
    /// on their first attempt
    #[serde(default)]
    pub reject_unknown_types: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: default_workers(),
            default_max_attempts: default_max_attempts(),
            shutdown_grace_period: default_shutdown_grace_period(),
            reject_unknown_types: false,
        }
    }
}

impl EngineConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            name: format!("{}-worker", self.name),
        }
    }
}

/// Exponential backoff: `base_delay * multiplier^(attempt - 1)`, capped.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self, default_max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            default_max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial_delay: self.base_delay,
                max_delay: self.max_delay,
                multiplier: self.multiplier,
            },
        }
    }
}

/// A periodic schedule declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Display name; defaults to the job type
    #[serde(default)]
    pub name: Option<String>,

    pub job_type: String,

    /// Fixed interval between ticks
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Cron expression (5 or 6 fields, UTC)
    #[serde(default)]
    pub cron: Option<String>,

    /// Payload submitted on every tick
    #[serde(default)]
    pub payload: Payload,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Tick once at startup (interval schedules)
    #[serde(default)]
    pub run_immediately: bool,

    #[serde(default)]
    pub overlap: OverlapPolicy,
}

// Default value functions
fn default_name() -> String { "conveyor".to_string() }
fn default_workers() -> usize { 4 }
fn default_max_attempts() -> u32 { 3 }
fn default_shutdown_grace_period() -> Duration { Duration::from_secs(30) }
fn default_base_delay() -> Duration { Duration::from_secs(2) }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> Duration { Duration::from_secs(3600) }

const ENV_PREFIX: &str = "CONVEYOR";
const CONFIG_FILE_STEM: &str = "conveyor";

impl Config {
    /// Load `conveyor.{toml,yaml,json}` from the working directory if
    /// present, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(".")
    }

    /// Like [`Config::load`], looking for the optional file in `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let base = dir.as_ref().join(CONFIG_FILE_STEM);
        let config = config::Config::builder()
            .add_source(config::File::with_name(&base.to_string_lossy()).required(false))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            return Err(ConveyorError::configuration("engine.workers must be at least 1"));
        }
        if self.engine.default_max_attempts == 0 {
            return Err(ConveyorError::configuration(
                "engine.default_max_attempts must be at least 1",
            ));
        }
        if self.retry.base_delay.is_zero() {
            return Err(ConveyorError::configuration("retry.base_delay must be greater than zero"));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConveyorError::configuration("retry.multiplier must be >= 1.0"));
        }

        for schedule in &self.schedules {
            let label = schedule.name.as_deref().unwrap_or(&schedule.job_type);
            match (&schedule.interval, &schedule.cron) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(ConveyorError::configuration(format!(
                        "schedule '{}' must set exactly one of interval or cron",
                        label
                    )))
                }
            }
            if schedule.max_attempts == Some(0) {
                return Err(ConveyorError::configuration(format!(
                    "schedule '{}' max_attempts must be at least 1",
                    label
                )));
            }
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy(self.engine.default_max_attempts)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.engine.name.clone(),
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.default_max_attempts, 3);
        assert_eq!(config.engine.shutdown_grace_period, Duration::from_secs(30));
        assert!(!config.engine.reject_unknown_types);
        assert!(config.schedules.is_empty());
        assert!(config.validate().is_ok());

        let policy = config.retry_policy();
        assert_eq!(policy.next_retry_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_retry_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[engine]
workers = 8
shutdown_grace_period = "5s"

[retry]
base_delay = "250ms"
multiplier = 3.0

[[schedules]]
name = "nightly-cleanup"
job_type = "cleanup"
cron = "0 3 * * *"

[[schedules]]
job_type = "heartbeat"
interval = "10s"
run_immediately = true
overlap = "skip_if_running"
payload = {{ source = "config" }}
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.shutdown_grace_period, Duration::from_secs(5));
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry_policy().next_retry_delay(2), Duration::from_millis(750));

        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[0].cron.as_deref(), Some("0 3 * * *"));
        let heartbeat = &config.schedules[1];
        assert_eq!(heartbeat.interval, Some(Duration::from_secs(10)));
        assert_eq!(heartbeat.overlap, OverlapPolicy::SkipIfRunning);
        assert!(heartbeat.run_immediately);
        assert_eq!(heartbeat.payload["source"], "config");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.engine.workers = 0;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = Config::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.base_delay = Duration::ZERO;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = Config::default();
        config.schedules.push(ScheduleConfig {
            name: None,
            job_type: "cleanup".to_string(),
            interval: Some(Duration::from_secs(1)),
            cron: Some("* * * * *".to_string()),
            payload: Payload::new(),
            max_attempts: None,
            run_immediately: false,
            overlap: OverlapPolicy::Allow,
        });
        assert!(config.validate().is_err());

        config.schedules[0].interval = None;
        assert!(config.validate().is_ok());
        config.schedules[0].cron = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_picks_up_optional_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.engine.workers, default_workers());

        std::fs::write(
            dir.path().join("conveyor.yaml"),
            "engine:\n  workers: 6\nretry:\n  base_delay: 500ms\n",
        )
        .unwrap();
        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.engine.workers, 6);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::from_file("/definitely/not/here.toml").unwrap_err();
        assert_eq!(err.code().category(), "configuration");
    }
}

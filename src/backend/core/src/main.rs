//! Conveyor Server - Main entry point
//!
//! Runs the job engine with the built-in handlers and the schedules declared
//! in configuration until SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::Parser;

use conveyor_core::{
    config::Config,
    jobs::{register_logging_builtins, HandlerRegistry, JobEngine},
    telemetry::{init_telemetry, LogFormat},
};

#[derive(Debug, Parser)]
#[command(name = "conveyor-server", version, about = "In-process background job engine")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }
    config.validate()?;

    // Initialize telemetry
    let telemetry = init_telemetry(&config.telemetry())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.engine.workers,
        "Starting Conveyor Server"
    );

    let mut registry = HandlerRegistry::new();
    register_logging_builtins(&mut registry);

    let engine = JobEngine::builder()
        .config(config.engine.clone())
        .retry_policy(config.retry_policy())
        .registry(registry)
        .build()?;

    for schedule in &config.schedules {
        let id = engine.schedule_from_config(schedule)?;
        tracing::info!(
            schedule_id = %id,
            job_type = %schedule.job_type,
            "Schedule registered"
        );
    }

    engine.start()?;

    shutdown_signal().await;

    let report = engine.shutdown().await?;
    let stats = engine.stats();
    tracing::info!(
        graceful = report.graceful,
        abandoned = report.abandoned,
        processed = stats.workers.processed,
        succeeded = stats.workers.succeeded,
        failed = stats.workers.failed,
        "Server shutdown complete"
    );

    telemetry.shutdown();
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

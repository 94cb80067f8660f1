/*!
 * Cirrus CLI
 *
 * `settings` shows how the engine would size itself on this machine.
 * `log-check` runs a throwaway job through the logging stack.
 */

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cirrus::{
    config::{EngineConfig, EnvironmentVariable, ProcessEnvironment},
    core::new_read_log_fn,
    error::{CirrusError, Result, EXIT_FATAL, EXIT_SUCCESS},
    logging::{self, LoggingContext},
    resolve_concurrency,
};
use cirrus_observability::{metrics, JobId, JobLogLayer, LogLevel, LogSink};

#[derive(Parser)]
#[command(name = "cirrus")]
#[command(version, about = "Transfer engine sizing and job logging", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Minimum job log level (overrides config and environment)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print resolved concurrency settings and the environment variables that
    /// control them
    Settings {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Write a short job log, exercising telemetry and retry logging
    LogCheck {
        /// URL reported by the simulated body-read retry
        #[arg(long, default_value = "https://example.invalid/container/blob?sig=secret")]
        url: String,

        /// Print Prometheus metrics after the check
        #[arg(long)]
        metrics: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<CirrusError>()
                .map_or(EXIT_FATAL, CirrusError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    match cli.command {
        Commands::Settings { json } => print_settings(&config, json)?,
        Commands::LogCheck { url, metrics } => log_check(config, &url, metrics)?,
    }
    Ok(())
}

fn print_settings(config: &EngineConfig, json: bool) -> Result<()> {
    let (limit, settings) = resolve_concurrency(config, &ProcessEnvironment)?;

    if json {
        let value = serde_json::json!({
            "max_file_and_socket_handles": limit.value,
            "handle_limit_source": limit.source.as_str(),
            "main_pool_size": settings.main_pool_size.value,
            "main_pool_size_source": settings.main_pool_size.description(),
            "transfer_initiation_pool_size": settings.transfer_initiation_pool_size.value,
            "transfer_initiation_pool_size_source": settings.transfer_initiation_pool_size.description(),
            "max_idle_connections": settings.max_idle_connections,
            "max_open_payload_files": settings.max_open_payload_files,
        });
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| CirrusError::Other(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    println!(
        "Max file and socket handles:   {} (from {})",
        limit.value,
        limit.source.as_str()
    );
    println!("{}", settings);
    println!();
    println!("Main pool size:                {}", settings.main_pool_size.description());
    println!(
        "Transfer initiation pool size: {}",
        settings.transfer_initiation_pool_size.description()
    );
    println!();
    println!("Environment variables:");
    for var in EnvironmentVariable::ALL {
        println!("  {:<40} {}", var.name, var.description);
    }
    Ok(())
}

fn log_check(config: EngineConfig, url: &str, show_metrics: bool) -> Result<()> {
    let layer = JobLogLayer::new();
    if let Err(e) = logging::init_logging(&config, Some(layer.clone())) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let ctx = LoggingContext::new(config).with_job_registry(layer.registry());
    let job_id = JobId::new();
    let logger = ctx.job_logger(job_id);
    logger.open()?;

    logger.log(LogLevel::Info, "Log check started")?;
    {
        let span = tracing::info_span!("job", job_id = %job_id);
        let _guard = span.enter();
        tracing::info!(telemetry = %ctx.telemetry_state(), "Bridged from tracing");
    }

    let sink: Arc<dyn LogSink> = logger.clone();
    let on_read_failure = new_read_log_fn(sink, url);
    let err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer");
    on_read_failure(1, &err, 0, 4 * 1024 * 1024, true);
    on_read_failure(2, &err, 0, 4 * 1024 * 1024, false);

    let outcome = logger.close()?;

    println!("Job:       {}", job_id);
    println!("Log file:  {}", logger.path().display());
    match outcome {
        Some(outcome) => println!("Telemetry: {}", outcome.as_str()),
        None => println!("Telemetry: {}", ctx.telemetry_state()),
    }

    if show_metrics {
        println!();
        print!("{}", metrics::metrics_text());
    }
    Ok(())
}

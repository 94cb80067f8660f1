/*!
 * Logging and tracing initialization
 *
 * Two kinds of logging meet here: process diagnostics go through `tracing`,
 * while each job gets its own `JobLogger`. `LoggingContext` is the host-side
 * factory for job loggers and owns the lazily started telemetry pipeline they
 * share.
 */

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use cirrus_observability::{
    JobId, JobLogLayer, JobLogRegistry, JobLogger, LogSink, PipelineState, TelemetryPipeline,
    TracingSink,
};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::EngineConfig;
use crate::error::{CirrusError, Result};

/// Initialize process diagnostics based on configuration
///
/// `RUST_LOG` overrides the configured level. When `job_layer` is given,
/// events inside a span carrying `job_id` are also copied into that job's log.
pub fn init_logging(config: &EngineConfig, job_layer: Option<JobLogLayer>) -> Result<()> {
    let directives = match config.log_level.to_tracing_level() {
        Some(level) => format!("cirrus={level},cirrus_observability={level}"),
        None => "off".to_string(),
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .map_err(|e| CirrusError::Config(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref path) = config.diagnostics_file {
        init_file_logging(path, env_filter, job_layer)
    } else {
        init_stdout_logging(env_filter, job_layer)
    }
}

fn init_stdout_logging(env_filter: EnvFilter, job_layer: Option<JobLogLayer>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(job_layer)
        .try_init()
        .map_err(|e| CirrusError::Config(format!("Failed to install subscriber: {}", e)))
}

fn init_file_logging(
    log_path: &Path,
    env_filter: EnvFilter,
    job_layer: Option<JobLogLayer>,
) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| CirrusError::Config(format!("Failed to open diagnostics file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(job_layer)
        .try_init()
        .map_err(|e| CirrusError::Config(format!("Failed to install subscriber: {}", e)))
}

/// Hands out job loggers that share one fallback sink and one telemetry
/// pipeline
///
/// The pipeline is started on the first request, at most once. A pipeline
/// that failed to start, or that was switched off, stays disabled for the
/// life of the context.
pub struct LoggingContext {
    config: EngineConfig,
    fallback: Arc<dyn LogSink>,
    pipeline: OnceLock<Option<Arc<TelemetryPipeline>>>,
    jobs: Option<JobLogRegistry>,
}

impl LoggingContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            fallback: Arc::new(TracingSink),
            pipeline: OnceLock::new(),
            jobs: None,
        }
    }

    /// Replace the default `TracingSink` fallback
    pub fn with_fallback(mut self, fallback: Arc<dyn LogSink>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Register every new job logger with a tracing bridge
    pub fn with_job_registry(mut self, jobs: JobLogRegistry) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared telemetry pipeline, started on first use
    ///
    /// A start failure is logged and leaves telemetry disabled; it never
    /// stops the job.
    pub fn telemetry(&self, job_id: &JobId) -> Option<Arc<TelemetryPipeline>> {
        self.pipeline
            .get_or_init(|| match self.start_telemetry(job_id) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        category = %e.category(),
                        fatal = e.is_fatal(),
                        "Telemetry disabled"
                    );
                    None
                }
            })
            .clone()
    }

    fn start_telemetry(&self, job_id: &JobId) -> Result<Option<Arc<TelemetryPipeline>>> {
        Ok(TelemetryPipeline::from_config(
            &self.config.telemetry,
            &job_id.to_string(),
        )?)
    }

    pub fn telemetry_state(&self) -> PipelineState {
        match self.pipeline.get() {
            None => PipelineState::Uninitialized,
            Some(None) => PipelineState::Disabled,
            Some(Some(pipeline)) => pipeline.state(),
        }
    }

    /// Construct (but do not open) the logger for `job_id`
    pub fn job_logger(&self, job_id: JobId) -> Arc<JobLogger> {
        let mut logger = JobLogger::new(
            job_id,
            self.config.log_level,
            &self.config.log_folder,
            Arc::clone(&self.fallback),
        );

        // A closing pipeline grants no lease; the job then logs to file only
        if let Some(pipeline) = self.telemetry(&job_id) {
            logger = logger.with_telemetry(&pipeline);
        }

        let logger = Arc::new(logger);
        if let Some(ref jobs) = self.jobs {
            jobs.register(&logger);
        }
        logger
    }
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cirrus=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

//! Tracing-to-job-log bridge layer
//!
//! [`JobLogLayer`] implements `tracing_subscriber::Layer` so engine code can
//! keep using `tracing::info!` and friends: any event recorded inside a span
//! carrying a `job_id` field is also written to that job's [`JobLogger`].
//!
//! ## Example
//!
//! ```no_run
//! use cirrus_observability::{JobId, JobLogLayer, JobLogger, LogLevel, TracingSink};
//! use std::sync::Arc;
//! use tracing_subscriber::prelude::*;
//!
//! let layer = JobLogLayer::new();
//! let jobs = layer.registry();
//! tracing_subscriber::registry().with(layer).init();
//!
//! let job_id = JobId::new();
//! let logger = Arc::new(JobLogger::new(job_id, LogLevel::Info, "logs", Arc::new(TracingSink)));
//! logger.open().unwrap();
//! jobs.register(&logger);
//!
//! let span = tracing::info_span!("transfer", job_id = %job_id);
//! let _guard = span.enter();
//! tracing::info!(bytes = 1024, "chunk done"); // lands in logs/<job_id>.log
//! ```

use crate::fallback::FALLBACK_TARGET;
use crate::job::JobId;
use crate::level::LogLevel;
use crate::logger::{JobLogger, LogSink};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock, Weak};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Job loggers reachable from tracing spans, keyed by job id
///
/// Holds weak references: a logger that has been dropped simply stops
/// receiving events.
#[derive(Clone, Default)]
pub struct JobLogRegistry {
    loggers: Arc<RwLock<HashMap<String, Weak<JobLogger>>>>,
}

impl JobLogRegistry {
    pub fn register(&self, logger: &Arc<JobLogger>) {
        let mut loggers = self.loggers.write().unwrap_or_else(|e| e.into_inner());
        loggers.retain(|_, weak| weak.strong_count() > 0);
        loggers.insert(logger.job_id().to_string(), Arc::downgrade(logger));
    }

    pub fn unregister(&self, job_id: &JobId) {
        self.loggers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id.to_string());
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<JobLogger>> {
        self.loggers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.loggers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Layer forwarding job-scoped tracing events into job logs
#[derive(Clone, Default)]
pub struct JobLogLayer {
    registry: JobLogRegistry,
}

impl JobLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle used to register job loggers after the subscriber is installed
    pub fn registry(&self) -> JobLogRegistry {
        self.registry.clone()
    }
}

/// Job id stored in span extensions
struct SpanJob(String);

impl<S> Layer<S> for JobLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut visitor = JobIdVisitor::default();
        attrs.record(&mut visitor);

        // Child spans inherit the job of their parent
        let job_id = visitor.job_id.or_else(|| {
            span.parent()
                .and_then(|parent| parent.extensions().get::<SpanJob>().map(|j| j.0.clone()))
        });

        if let Some(job_id) = job_id {
            span.extensions_mut().insert(SpanJob(job_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Our own diagnostics must never feed back into a job log
        if metadata.target().starts_with("cirrus_observability")
            || metadata.target() == FALLBACK_TARGET
        {
            return;
        }

        let Some(job_id) = ctx
            .event_span(event)
            .and_then(|span| span.extensions().get::<SpanJob>().map(|j| j.0.clone()))
        else {
            return;
        };
        let Some(logger) = self.registry.get(&job_id) else {
            return;
        };

        let level = LogLevel::from(*metadata.level());
        if !logger.should_log(level) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Err(e) = logger.log(level, &visitor.finish()) {
            tracing::debug!(
                target: "cirrus_observability::bridge",
                job_id = %job_id,
                error = %e,
                "Dropped bridged event"
            );
        }
    }
}

/// Visitor for extracting `job_id` from span fields
#[derive(Default)]
struct JobIdVisitor {
    job_id: Option<String>,
}

impl tracing::field::Visit for JobIdVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "job_id" {
            self.job_id = Some(format!("{:?}", value).trim_matches('"').to_string());
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "job_id" {
            self.job_id = Some(value.to_string());
        }
    }
}

/// Visitor rendering an event as `message key=value ...`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

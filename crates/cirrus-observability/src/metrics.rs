//! Prometheus metrics for job logging and telemetry delivery
//!
//! Telemetry is best-effort, so losses are never reported to callers. These
//! counters are where drops, delivery failures and shutdown outcomes become
//! visible to operators.

use prometheus::{CounterVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

/// Global Prometheus registry for Cirrus metrics
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Job log lines written, by level
pub static LOG_LINES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Telemetry records accepted into the pipeline queue, by kind (event, exception)
pub static TELEMETRY_QUEUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Telemetry records dropped because the queue was full or the pipeline closed
pub static TELEMETRY_DROPPED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Telemetry records acknowledged by the transport
pub static TELEMETRY_DELIVERED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Failed batch deliveries
pub static TELEMETRY_SEND_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Pipeline shutdowns, by outcome
pub static TELEMETRY_SHUTDOWNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Get or initialize the global registry
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let r = Registry::new();
        register_metrics(&r);
        r
    })
}

fn register_metrics(registry: &Registry) {
    let lines = IntCounterVec::new(
        Opts::new("cirrus_job_log_lines_total", "Job log lines written"),
        &["level"],
    )
    .expect("Failed to create job_log_lines metric");
    registry
        .register(Box::new(lines.clone()))
        .expect("Failed to register job_log_lines");
    LOG_LINES_TOTAL.set(lines).ok();

    let queued = IntCounterVec::new(
        Opts::new(
            "cirrus_telemetry_queued_total",
            "Telemetry records accepted into the delivery queue",
        ),
        &["kind"],
    )
    .expect("Failed to create telemetry_queued metric");
    registry
        .register(Box::new(queued.clone()))
        .expect("Failed to register telemetry_queued");
    TELEMETRY_QUEUED_TOTAL.set(queued).ok();

    let dropped = IntCounter::with_opts(Opts::new(
        "cirrus_telemetry_dropped_total",
        "Telemetry records dropped before delivery",
    ))
    .expect("Failed to create telemetry_dropped metric");
    registry
        .register(Box::new(dropped.clone()))
        .expect("Failed to register telemetry_dropped");
    TELEMETRY_DROPPED_TOTAL.set(dropped).ok();

    let delivered = IntCounter::with_opts(Opts::new(
        "cirrus_telemetry_delivered_total",
        "Telemetry records acknowledged by the transport",
    ))
    .expect("Failed to create telemetry_delivered metric");
    registry
        .register(Box::new(delivered.clone()))
        .expect("Failed to register telemetry_delivered");
    TELEMETRY_DELIVERED_TOTAL.set(delivered).ok();

    let failures = IntCounter::with_opts(Opts::new(
        "cirrus_telemetry_send_failures_total",
        "Telemetry batch deliveries that failed",
    ))
    .expect("Failed to create telemetry_send_failures metric");
    registry
        .register(Box::new(failures.clone()))
        .expect("Failed to register telemetry_send_failures");
    TELEMETRY_SEND_FAILURES_TOTAL.set(failures).ok();

    let shutdowns = CounterVec::new(
        Opts::new(
            "cirrus_telemetry_shutdowns_total",
            "Telemetry pipeline shutdowns by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create telemetry_shutdowns metric");
    registry
        .register(Box::new(shutdowns.clone()))
        .expect("Failed to register telemetry_shutdowns");
    TELEMETRY_SHUTDOWNS_TOTAL.set(shutdowns).ok();
}

fn metric<T>(cell: &'static OnceLock<T>) -> Option<&'static T> {
    registry();
    cell.get()
}

/// Count a job log line
pub fn inc_log_line(level: &str) {
    if let Some(counter) = metric(&LOG_LINES_TOTAL) {
        counter.with_label_values(&[level]).inc();
    }
}

/// Count a record accepted into the telemetry queue
pub fn inc_telemetry_queued(kind: &str) {
    if let Some(counter) = metric(&TELEMETRY_QUEUED_TOTAL) {
        counter.with_label_values(&[kind]).inc();
    }
}

/// Count records lost before delivery
pub fn inc_telemetry_dropped(count: u64) {
    if let Some(counter) = metric(&TELEMETRY_DROPPED_TOTAL) {
        counter.inc_by(count);
    }
}

/// Count records acknowledged by the transport
pub fn inc_telemetry_delivered(count: u64) {
    if let Some(counter) = metric(&TELEMETRY_DELIVERED_TOTAL) {
        counter.inc_by(count);
    }
}

/// Count a failed batch delivery
pub fn inc_telemetry_send_failure() {
    if let Some(counter) = metric(&TELEMETRY_SEND_FAILURES_TOTAL) {
        counter.inc();
    }
}

/// Record how a pipeline shutdown ended
pub fn record_shutdown(outcome: &str) {
    if let Some(counter) = metric(&TELEMETRY_SHUTDOWNS_TOTAL) {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Get metrics in Prometheus text format
pub fn metrics_text() -> String {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_initialization() {
        let reg = registry();
        inc_telemetry_dropped(0);
        assert!(!reg.gather().is_empty());
    }

    #[test]
    fn test_inc_log_line() {
        inc_log_line("INFO");
        inc_log_line("ERROR");

        let output = metrics_text();
        assert!(output.contains("cirrus_job_log_lines_total"));
        assert!(output.contains("level=\"INFO\""));
    }

    #[test]
    fn test_telemetry_counters() {
        inc_telemetry_queued("event");
        inc_telemetry_delivered(3);
        inc_telemetry_send_failure();
        record_shutdown("drained");

        let output = metrics_text();
        assert!(output.contains("cirrus_telemetry_queued_total"));
        assert!(output.contains("cirrus_telemetry_delivered_total"));
        assert!(output.contains("cirrus_telemetry_send_failures_total"));
        assert!(output.contains("outcome=\"drained\""));
    }

    #[test]
    fn test_delivered_counter_is_monotonic() {
        let before = metric(&TELEMETRY_DELIVERED_TOTAL).unwrap().get();
        inc_telemetry_delivered(5);
        let after = metric(&TELEMETRY_DELIVERED_TOTAL).unwrap().get();
        assert!(after >= before + 5);
    }
}

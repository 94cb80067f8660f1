/*!
 * Logging hook for body-read retries
 *
 * The HTTP layer retries failed body reads on its own; it only needs a
 * callback that reports each failure to the job log in a consistent shape.
 */

use std::error::Error;
use std::sync::Arc;

use cirrus_observability::{redact_secret_query_params, LogLevel, LogSink};

/// Prefix of attempt numbers in retry log lines, shared with request-level
/// retries so `Try=2` finds every second attempt of either kind
pub const TRY_EQUALS: &str = "Try=";

/// Callback invoked after each failed body read:
/// `(failure_count, error, offset, count, will_retry)`
pub type ReadLogFn = Box<dyn Fn(u32, &dyn Error, u64, u64, bool) + Send + Sync>;

/// Build the body-read retry callback for `url`
///
/// The URL is redacted once, here. Each invocation logs at info level and
/// reports the number of the *next* attempt.
pub fn new_read_log_fn(logger: Arc<dyn LogSink>, url: &str) -> ReadLogFn {
    let redacted_url = redact_secret_query_params(url).into_owned();

    Box::new(
        move |failure_count: u32, err: &dyn Error, offset: u64, count: u64, will_retry: bool| {
            let message = read_retry_message(failure_count, err, offset, count, will_retry, &redacted_url);
            if let Err(e) = logger.log(LogLevel::Info, &message) {
                tracing::warn!(error = %e, "Failed to record body-read retry");
            }
        },
    )
}

fn read_retry_message(
    failure_count: u32,
    err: &dyn Error,
    offset: u64,
    count: u64,
    will_retry: bool,
    redacted_url: &str,
) -> String {
    let retry_message = if will_retry {
        "Will retry"
    } else {
        "Will NOT retry"
    };

    format!(
        "Error reading body of reply. Next try (if any) will be {}{}. {}. Error: {}. Offset: {}  Count: {} URL: {}",
        TRY_EQUALS,
        failure_count.saturating_add(1),
        retry_message,
        err,
        offset,
        count,
        redacted_url
    )
}

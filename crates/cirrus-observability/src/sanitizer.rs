//! Secret redaction for log and telemetry text
//!
//! Every message is passed through a [`Sanitizer`] before it reaches a file
//! or the telemetry pipeline. The default [`SecretRedactor`] removes
//! signature and token query parameters from URLs and the values of
//! authorization headers.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Marker substituted for redacted values
pub const REDACTED: &str = "REDACTED";

/// Query parameters whose values are credentials
const SECRET_QUERY_PARAMS: &[&str] = &[
    "sig",
    "signature",
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-security-token",
    "x-goog-signature",
    "x-goog-credential",
    "token",
    "access_token",
    "sas_token",
];

/// Headers whose values are credentials
const SECRET_HEADERS: &[&str] = &[
    "x-ms-copy-source-authorization",
    "proxy-authorization",
    "authorization",
];

/// Redacts secret material from text
///
/// Implementations must be pure and must never panic: on input they do not
/// understand they return it unchanged.
pub trait Sanitizer: Send + Sync {
    fn sanitize<'a>(&self, message: &'a str) -> Cow<'a, str>;
}

/// Default sanitizer for query-string credentials and authorization headers
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretRedactor;

impl SecretRedactor {
    pub fn new() -> Self {
        Self
    }
}

impl Sanitizer for SecretRedactor {
    fn sanitize<'a>(&self, message: &'a str) -> Cow<'a, str> {
        match redact_headers(message) {
            Cow::Borrowed(unchanged) => redact_secret_query_params(unchanged),
            Cow::Owned(headers_done) => {
                Cow::Owned(redact_secret_query_params(&headers_done).into_owned())
            }
        }
    }
}

fn query_param_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let names = SECRET_QUERY_PARAMS
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r#"(?i)([?&](?:{names})=)[^&\s#"']*"#))
            .expect("secret query pattern is valid")
    })
}

fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let names = SECRET_HEADERS
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?im)\b((?:{names})\s*:[ \t]*)[^\r\n]*"))
            .expect("secret header pattern is valid")
    })
}

/// Replace the values of credential query parameters with [`REDACTED`]
///
/// Works on full URLs and on free text that embeds URLs.
pub fn redact_secret_query_params(text: &str) -> Cow<'_, str> {
    query_param_pattern().replace_all(text, format!("${{1}}{REDACTED}").as_str())
}

fn redact_headers(text: &str) -> Cow<'_, str> {
    header_pattern().replace_all(text, format!("${{1}}{REDACTED}").as_str())
}

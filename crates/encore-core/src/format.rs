//! Error formatting for the three surfaces errors reach: the user, the log
//! pipeline, and transient toast notifications.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{ClassifiedError, ErrorClass, Severity};
use crate::redact::{redact_secrets, redact_value};

/// Maximum length (in characters) of a toast line.
pub const TOAST_MAX_LEN: usize = 120;

// ─────────────────────────────────────────────────────────────────────────────
// User-facing
// ─────────────────────────────────────────────────────────────────────────────

/// A user-facing rendering of an error.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserMessage {
    /// Display severity.
    pub severity: Severity,
    /// Icon matching the severity.
    pub icon: &'static str,
    /// Short headline.
    pub headline: String,
    /// Longer explanation (redacted).
    pub body: String,
    /// Suggested next step.
    pub hint: Option<String>,
}

fn headline(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Transient => "Connection problem",
        ErrorClass::RateLimit => "Rate limit reached",
        ErrorClass::ServerError => "Provider error",
        ErrorClass::ClientError => "Request rejected",
        ErrorClass::Auth => "Authentication failed",
        ErrorClass::Timeout => "Request timed out",
        ErrorClass::Aborted => "Cancelled",
        ErrorClass::Quota => "Storage or usage quota exceeded",
        ErrorClass::InvalidState => "Operation not available right now",
        ErrorClass::CircuitOpen => "Temporarily paused",
        ErrorClass::Unknown => "Something went wrong",
    }
}

/// Render an error for display to the user.
pub fn format_user(err: &ClassifiedError) -> UserMessage {
    let severity = err.class.severity();
    UserMessage {
        severity,
        icon: severity.icon(),
        headline: headline(err.class).to_owned(),
        body: redact_secrets(&err.message),
        hint: err.hint.clone(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Log-oriented
// ─────────────────────────────────────────────────────────────────────────────

/// A structured, sanitized error record for log shipping.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Error class.
    pub classification: ErrorClass,
    /// Stable code.
    pub code: String,
    /// Redacted message.
    pub message: String,
    /// Redacted messages of the source chain, outermost first.
    pub chain: Vec<String>,
    /// Redacted context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// RFC 3339 timestamp.
    pub timestamp: String,
}

/// Render a classified error as a log record.
pub fn format_log(err: &ClassifiedError) -> LogRecord {
    LogRecord {
        classification: err.class,
        code: err.code.clone(),
        message: redact_secrets(&err.message),
        chain: Vec::new(),
        context: err
            .context
            .iter()
            .map(|(k, v)| (k.clone(), redact_value(v)))
            .collect(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Render any error (with its `source()` chain) as a log record.
///
/// The outermost message is classified with [`ClassifiedError::from_message`].
pub fn format_log_error(err: &(dyn std::error::Error + 'static)) -> LogRecord {
    let classified = ClassifiedError::from_message(err.to_string());
    let mut record = format_log(&classified);
    let mut source = err.source();
    while let Some(inner) = source {
        record.chain.push(redact_secrets(&inner.to_string()));
        source = inner.source();
    }
    record
}

// ─────────────────────────────────────────────────────────────────────────────
// Toast
// ─────────────────────────────────────────────────────────────────────────────

/// Render a single line of at most [`TOAST_MAX_LEN`] characters.
pub fn format_toast(err: &ClassifiedError) -> String {
    let icon = err.class.severity().icon();
    let body = redact_secrets(&err.message);
    let first_line = body.lines().next().unwrap_or_default();
    let line = format!("{icon} {}: {first_line}", headline(err.class));
    truncate_chars(&line, TOAST_MAX_LEN)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

//! Error taxonomy shared across the retrieval core.
//!
//! Errors are classified once, at the lowest layer that can identify them,
//! and carried upward unchanged as a [`ClassifiedError`]:
//!
//! - [`ErrorClass`]: the closed taxonomy retry decisions are made on
//! - [`ClassifiedError`]: class + stable code + message + optional hint
//! - [`Severity`]: display severity derived from the class
//!
//! String-based classification lives in [`classify`].

pub mod classify;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::classify::{classify, extract_status};

// ─────────────────────────────────────────────────────────────────────────────
// ErrorClass
// ─────────────────────────────────────────────────────────────────────────────

/// Error class used for retry decisions and formatting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blips, connection resets, generic transient failures.
    Transient,
    /// HTTP 429 or an equivalent provider signal.
    RateLimit,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx other than auth and rate limiting.
    ClientError,
    /// HTTP 401/403 or an invalid credential.
    Auth,
    /// A deadline or time budget was exceeded.
    Timeout,
    /// The operation was cancelled by the caller.
    Aborted,
    /// A storage or usage quota was exhausted.
    Quota,
    /// The component was in a state that does not admit the operation.
    InvalidState,
    /// A circuit breaker refused the call.
    CircuitOpen,
    /// Nothing matched.
    Unknown,
}

impl ErrorClass {
    /// Whether errors of this class may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimit | Self::ServerError | Self::Timeout
        )
    }

    /// Stable code used when no component-specific code applies.
    pub fn default_code(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::ClientError => "CLIENT_ERROR",
            Self::Auth => "AUTH",
            Self::Timeout => "TIMEOUT",
            Self::Aborted => "ABORTED",
            Self::Quota => "QUOTA_EXCEEDED",
            Self::InvalidState => "INVALID_STATE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Suggested next step for the user, if there is a useful one.
    pub fn default_hint(self) -> Option<&'static str> {
        match self {
            Self::Transient => Some("Check your connection and try again"),
            Self::RateLimit => Some("Wait a moment and try again"),
            Self::ServerError => Some("The provider is having trouble; try again shortly"),
            Self::Auth => Some("Check that your API key is valid and has access to this model"),
            Self::Timeout => Some("The request took too long; try a shorter question"),
            Self::Quota => Some("Free up browser storage or check your account usage limits"),
            Self::CircuitOpen => Some("Requests are paused after repeated failures; retry later"),
            Self::ClientError | Self::Aborted | Self::InvalidState | Self::Unknown => None,
        }
    }

    /// Display severity for this class.
    pub fn severity(self) -> Severity {
        match self {
            Self::Aborted => Severity::Info,
            Self::Transient | Self::RateLimit | Self::ServerError | Self::Timeout => {
                Severity::Warning
            }
            Self::ClientError
            | Self::Auth
            | Self::Quota
            | Self::InvalidState
            | Self::CircuitOpen
            | Self::Unknown => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::Quota => "quota",
            Self::InvalidState => "invalid_state",
            Self::CircuitOpen => "circuit_open",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Display severity levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational (e.g. user-initiated cancellation).
    Info,
    /// Recoverable or temporary.
    Warning,
    /// Needs user action.
    Error,
}

impl Severity {
    /// Icon shown next to user-facing messages.
    pub fn icon(self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Error => "❌",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ClassifiedError
// ─────────────────────────────────────────────────────────────────────────────

/// An error with its classification attached.
///
/// This is the currency every component reports failures in. It is cheap to
/// clone so the turn queue can hand the same error to the submitter and to
/// event subscribers.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct ClassifiedError {
    /// Taxonomy class.
    pub class: ErrorClass,
    /// Stable machine-readable code (e.g. `RATE_LIMIT`, `CHECKPOINT_CORRUPT`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Actionable hint, when one applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// HTTP status the error was derived from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Server-suggested delay before retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Structured context for logs.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ClassifiedError {
    /// Create an error with an explicit class and code.
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
            hint: class.default_hint().map(ToOwned::to_owned),
            status: None,
            retry_after_ms: None,
            context: BTreeMap::new(),
        }
    }

    /// Create an error of the given class using the class's default code.
    pub fn of(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::new(class, class.default_code(), message)
    }

    /// Classify a raw message (no error name available).
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::from_named("", message)
    }

    /// Classify an error by its name (e.g. `AbortError`) and message.
    pub fn from_named(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify(name, &message);
        let mut err = Self::of(class, message);
        err.status = extract_status(&err.message);
        err
    }

    /// Build an error from an HTTP status code and response body.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            401 | 403 => ErrorClass::Auth,
            408 => ErrorClass::Timeout,
            429 => ErrorClass::RateLimit,
            400..=499 => ErrorClass::ClientError,
            500..=599 => ErrorClass::ServerError,
            _ => ErrorClass::Unknown,
        };
        let mut err = Self::of(class, message);
        err.status = Some(status);
        err
    }

    /// Cancellation error delivered for dropped or cleared work.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Aborted, "CANCELLED", message)
    }

    /// Cancellation observed mid-operation.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::of(ErrorClass::Aborted, message)
    }

    /// Attach or replace the hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a server-suggested retry delay.
    #[must_use]
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// Attach a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let _ = self.context.insert(key.into(), value.into());
        self
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    /// Whether this error represents cancellation.
    pub fn is_aborted(&self) -> bool {
        self.class == ErrorClass::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        let retryable = [
            ErrorClass::Transient,
            ErrorClass::RateLimit,
            ErrorClass::ServerError,
            ErrorClass::Timeout,
        ];
        let terminal = [
            ErrorClass::Auth,
            ErrorClass::ClientError,
            ErrorClass::Aborted,
            ErrorClass::Quota,
            ErrorClass::InvalidState,
            ErrorClass::CircuitOpen,
            ErrorClass::Unknown,
        ];
        for class in retryable {
            assert!(class.is_retryable(), "{class} should be retryable");
        }
        for class in terminal {
            assert!(!class.is_retryable(), "{class} should not be retryable");
        }
    }

    #[test]
    fn display_uses_code_and_message() {
        let err = ClassifiedError::new(ErrorClass::InvalidState, "ALREADY_RUNNING", "task active");
        assert_eq!(err.to_string(), "[ALREADY_RUNNING] task active");
    }

    #[test]
    fn from_status_maps_classes() {
        assert_eq!(ClassifiedError::from_status(401, "x").class, ErrorClass::Auth);
        assert_eq!(ClassifiedError::from_status(403, "x").class, ErrorClass::Auth);
        assert_eq!(ClassifiedError::from_status(404, "x").class, ErrorClass::ClientError);
        assert_eq!(ClassifiedError::from_status(408, "x").class, ErrorClass::Timeout);
        assert_eq!(ClassifiedError::from_status(429, "x").class, ErrorClass::RateLimit);
        assert_eq!(ClassifiedError::from_status(503, "x").class, ErrorClass::ServerError);
        assert_eq!(ClassifiedError::from_status(503, "x").status, Some(503));
    }

    #[test]
    fn from_message_extracts_status() {
        let err = ClassifiedError::from_message("HTTP 429 Too Many Requests");
        assert_eq!(err.class, ErrorClass::RateLimit);
        assert_eq!(err.code, "RATE_LIMIT");
        assert_eq!(err.status, Some(429));
    }

    #[test]
    fn cancelled_is_aborted_class() {
        let err = ClassifiedError::cancelled("cleared");
        assert!(err.is_aborted());
        assert_eq!(err.code, "CANCELLED");
        assert!(!err.is_retryable());
    }

    #[test]
    fn default_hint_applied() {
        let err = ClassifiedError::of(ErrorClass::RateLimit, "slow down");
        assert_eq!(err.hint.as_deref(), Some("Wait a moment and try again"));
        let err = ClassifiedError::of(ErrorClass::Unknown, "?");
        assert!(err.hint.is_none());
    }

    #[test]
    fn serde_camel_case_skips_empty() {
        let err = ClassifiedError::of(ErrorClass::Timeout, "late").with_retry_after_ms(50);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["class"], "timeout");
        assert_eq!(value["retryAfterMs"], 50);
        assert!(value.get("context").is_none());
        assert!(value.get("status").is_none());
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(ErrorClass::Aborted.severity(), Severity::Info);
        assert_eq!(ErrorClass::RateLimit.severity(), Severity::Warning);
        assert_eq!(ErrorClass::Auth.severity(), Severity::Error);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClassifiedError>();
    }
}

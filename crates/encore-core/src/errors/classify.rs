//! String-based error classification.
//!
//! Provider SDKs, storage backends, and the network stack surface failures as
//! an error name plus a free-form message. [`classify`] maps that pair onto an
//! [`ErrorClass`] by checking an ordered pattern table; the first match wins.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::ErrorClass;

// ─────────────────────────────────────────────────────────────────────────────
// Pattern table
// ─────────────────────────────────────────────────────────────────────────────

struct ClassPattern {
    check: fn(name: &str, lower: &str) -> bool,
    class: ErrorClass,
}

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([45]\d\d)\b").unwrap());

/// Extract the first 4xx/5xx status code mentioned in a message.
pub fn extract_status(message: &str) -> Option<u16> {
    STATUS_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn status_class(lower: &str) -> Option<ErrorClass> {
    let status = extract_status(lower)?;
    Some(match status {
        401 | 403 => ErrorClass::Auth,
        408 => ErrorClass::Timeout,
        429 => ErrorClass::RateLimit,
        500..=599 => ErrorClass::ServerError,
        _ => ErrorClass::ClientError,
    })
}

/// Socket-level aborts are network failures, not caller cancellation.
const CONNECTION_ABORTED: &[&str] = &["econnaborted", "connection aborted"];

const CANCELLATION: &[&str] = &[
    "cancelled",
    "canceled",
    "aborted by user",
    "user aborted",
    "request aborted",
    "operation aborted",
    "operation was aborted",
];

/// Failure wording with no more specific hint.
const GENERIC_FAILURE: &[&str] = &["failed", "failure", "error"];

fn any(lower: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| lower.contains(n))
}

/// Textual patterns, checked in order after the status-code scan.
fn patterns() -> &'static [ClassPattern] {
    static PATTERNS: &[ClassPattern] = &[
        ClassPattern {
            check: |_, l| any(l, CONNECTION_ABORTED),
            class: ErrorClass::Transient,
        },
        ClassPattern {
            check: |s, l| s == "AbortError" || any(l, CANCELLATION),
            class: ErrorClass::Aborted,
        },
        ClassPattern {
            check: |_, l| l.contains("circuit open") || l.contains("circuit breaker"),
            class: ErrorClass::CircuitOpen,
        },
        ClassPattern {
            check: |s, l| s == "QuotaExceededError" || l.contains("quota"),
            class: ErrorClass::Quota,
        },
        ClassPattern {
            check: |s, l| s == "InvalidStateError" || l.contains("invalid state"),
            class: ErrorClass::InvalidState,
        },
    ];
    PATTERNS
}

fn text_patterns() -> &'static [ClassPattern] {
    static PATTERNS: &[ClassPattern] = &[
        ClassPattern {
            check: |_, l| {
                any(
                    l,
                    &[
                        "unauthorized",
                        "forbidden",
                        "invalid api key",
                        "invalid x-api-key",
                        "authentication",
                        "permission denied",
                    ],
                )
            },
            class: ErrorClass::Auth,
        },
        ClassPattern {
            check: |_, l| any(l, &["rate limit", "rate_limit", "too many requests"]),
            class: ErrorClass::RateLimit,
        },
        ClassPattern {
            check: |s, l| {
                s == "TimeoutError" || any(l, &["timed out", "timeout", "etimedout", "deadline"])
            },
            class: ErrorClass::Timeout,
        },
        ClassPattern {
            check: |_, l| {
                any(
                    l,
                    &["overloaded", "internal server error", "bad gateway", "server error"],
                )
            },
            class: ErrorClass::ServerError,
        },
        ClassPattern {
            check: |_, l| any(l, &["bad request", "invalid request", "not found", "unprocessable"]),
            class: ErrorClass::ClientError,
        },
        ClassPattern {
            check: |s, l| {
                (s == "TypeError" && l.contains("fetch"))
                    || any(
                        l,
                        &[
                            "econnreset",
                            "econnrefused",
                            "network",
                            "fetch failed",
                            "socket hang up",
                            "unavailable",
                            "connection reset",
                            "failed to fetch",
                        ],
                    )
            },
            class: ErrorClass::Transient,
        },
    ];
    PATTERNS
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Classify an error from its name and message.
///
/// Order: connection aborts, cancellation, circuit, quota, invalid state,
/// HTTP status codes, then textual hints. Generic failure wording is
/// [`ErrorClass::Transient`]; anything else is [`ErrorClass::Unknown`].
pub fn classify(name: &str, message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if let Some(p) = patterns().iter().find(|p| (p.check)(name, &lower)) {
        return p.class;
    }
    if let Some(class) = status_class(&lower) {
        return class;
    }
    if let Some(p) = text_patterns().iter().find(|p| (p.check)(name, &lower)) {
        return p.class;
    }
    if any(&lower, GENERIC_FAILURE) {
        ErrorClass::Transient
    } else {
        ErrorClass::Unknown
    }
}

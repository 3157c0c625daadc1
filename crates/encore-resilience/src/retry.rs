//! Classified-error retry with exponential backoff.
//!
//! - [`RetryConfig`]: retry parameters
//! - [`backoff_delay_ms`]: pure backoff math (exponential, jitter, rate-limit floor)
//! - [`with_retry`]: async executor with cancellation, observer callbacks, and
//!   a [`RetrySummary`] of every attempt
//!
//! Only [`ErrorClass::is_retryable`] classes are retried. Cancellation is
//! never retried and never wrapped.

use std::future::Future;
use std::time::Duration;

use encore_core::{ClassifiedError, ErrorClass};
use encore_settings::RetrySettings;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Retry parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Base delay for exponential backoff in ms (default: 1000).
    pub base_delay_ms: u64,
    /// Cap on the exponential component in ms (default: 30000).
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each delay (default: 200).
    pub jitter_ms: u64,
    /// Minimum delay after a rate-limit error (default: 5000).
    pub rate_limit_floor_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryConfig {
    /// Build from the `retry` settings section.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            jitter_ms: settings.jitter_ms,
            rate_limit_floor_ms: settings.rate_limit_floor_ms,
        }
    }

    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Delay before retry number `retry` (zero-based).
///
/// Formula: `min(max_delay, base_delay * 2^retry) + random * jitter`, raised
/// to the rate-limit floor for [`ErrorClass::RateLimit`] and to any
/// server-suggested `retry_after_ms`.
///
/// `random` should be a value in `[0.0, 1.0)` from a PRNG.
pub fn backoff_delay_ms(
    retry: u32,
    class: ErrorClass,
    retry_after_ms: Option<u64>,
    config: &RetryConfig,
    random: f64,
) -> u64 {
    let exponential = config.base_delay_ms.saturating_mul(1u64 << retry.min(31));
    let capped = exponential.min(config.max_delay_ms);
    let jitter = (random.clamp(0.0, 1.0) * config.jitter_ms as f64).round() as u64;

    let mut delay = capped.saturating_add(jitter);
    if class == ErrorClass::RateLimit {
        delay = delay.max(config.rate_limit_floor_ms);
    }
    if let Some(suggested) = retry_after_ms {
        delay = delay.max(suggested);
    }
    delay
}

// ─────────────────────────────────────────────────────────────────────────────
// Observer
// ─────────────────────────────────────────────────────────────────────────────

/// Notification sent before every backoff pause.
#[derive(Clone, Copy, Debug)]
pub struct RetryEvent<'a> {
    /// The error that triggered the retry.
    pub error: &'a ClassifiedError,
    /// One-based number of the retry about to happen.
    pub attempt: u32,
    /// Pause before the retry.
    pub delay_ms: u64,
    /// Caller-supplied label of the operation.
    pub context: &'a str,
}

/// Receives a [`RetryEvent`] for every pause.
pub trait RetryObserver: Send + Sync {
    /// Called before sleeping.
    fn on_retry(&self, event: &RetryEvent<'_>);
}

impl<F> RetryObserver for F
where
    F: Fn(&RetryEvent<'_>) + Send + Sync,
{
    fn on_retry(&self, event: &RetryEvent<'_>) {
        self(event);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Accounting for a retried operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySummary {
    /// Total attempts made (1-based).
    pub attempts: u32,
    /// Retries performed (`attempts - 1` unless cancelled before the first).
    pub retries: u32,
    /// Wall time from first attempt to outcome.
    pub total_elapsed_ms: u64,
    /// Pause taken before each retry.
    pub delays_ms: Vec<u64>,
    /// Error of every failed attempt, in order.
    pub errors: Vec<ClassifiedError>,
}

/// Result plus [`RetrySummary`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result.
    pub result: Result<T, ClassifiedError>,
    /// Attempt accounting.
    pub summary: RetrySummary,
}

impl<T> RetryOutcome<T> {
    /// Drop the summary.
    pub fn into_result(self) -> Result<T, ClassifiedError> {
        self.result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Run `op` until it succeeds, fails terminally, or retries are exhausted.
///
/// `op` receives the zero-based attempt number. The backoff sleep races the
/// cancellation token; cancellation yields an `aborted` error immediately.
pub async fn with_retry<T, F, Fut>(
    context: &str,
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    observer: Option<&dyn RetryObserver>,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
{
    let started = Instant::now();
    let mut summary = RetrySummary::default();

    let finish = |mut summary: RetrySummary, result: Result<T, ClassifiedError>| {
        summary.total_elapsed_ms = started.elapsed().as_millis() as u64;
        RetryOutcome { result, summary }
    };

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            let err = ClassifiedError::aborted(format!("{context} cancelled"));
            summary.errors.push(err.clone());
            return finish(summary, Err(err));
        }

        let attempt = summary.attempts;
        summary.attempts += 1;

        let err = match op(attempt).await {
            Ok(value) => return finish(summary, Ok(value)),
            Err(err) => err,
        };
        summary.errors.push(err.clone());

        if err.is_aborted() || !err.is_retryable() || summary.retries >= config.max_retries {
            if err.is_retryable() && !err.is_aborted() {
                warn!(
                    context,
                    attempts = summary.attempts,
                    code = %err.code,
                    "retries exhausted"
                );
            }
            return finish(summary, Err(err));
        }

        let delay_ms = backoff_delay_ms(
            summary.retries,
            err.class,
            err.retry_after_ms,
            config,
            rand::random::<f64>(),
        );
        summary.retries += 1;
        summary.delays_ms.push(delay_ms);

        metrics::counter!("retry_attempts_total", "class" => err.class.to_string()).increment(1);
        debug!(
            context,
            attempt = summary.retries,
            delay_ms,
            class = %err.class,
            "retrying after backoff"
        );
        if let Some(observer) = observer {
            observer.on_retry(&RetryEvent {
                error: &err,
                attempt: summary.retries,
                delay_ms,
                context,
            });
        }

        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        if let Some(token) = cancel {
            tokio::select! {
                () = sleep => {}
                () = token.cancelled() => {
                    let err = ClassifiedError::aborted(format!("{context} cancelled during backoff"));
                    summary.errors.push(err.clone());
                    return finish(summary, Err(err));
                }
            }
        } else {
            sleep.await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    use super::*;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_ms: 0,
            rate_limit_floor_ms: 5000,
        }
    }

    // -- backoff_delay_ms --

    #[test]
    fn backoff_exponential_growth() {
        let config = RetryConfig {
            jitter_ms: 0,
            ..RetryConfig::default()
        };
        let delays: Vec<u64> = (0..4)
            .map(|n| backoff_delay_ms(n, ErrorClass::Transient, None, &config, 0.0))
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn backoff_caps_at_max() {
        let config = RetryConfig::default();
        assert_eq!(
            backoff_delay_ms(10, ErrorClass::ServerError, None, &config, 0.0),
            30_000
        );
    }

    #[test]
    fn backoff_jitter_bounded() {
        let config = RetryConfig::default();
        let lo = backoff_delay_ms(0, ErrorClass::Transient, None, &config, 0.0);
        let hi = backoff_delay_ms(0, ErrorClass::Transient, None, &config, 0.999);
        assert_eq!(lo, 1000);
        assert!(hi <= 1200 && hi > 1000);
    }

    #[test]
    fn backoff_rate_limit_floor() {
        let config = RetryConfig::default();
        for retry in 0..3 {
            let d = backoff_delay_ms(retry, ErrorClass::RateLimit, None, &config, 0.0);
            assert!(d >= 5000, "retry {retry}: {d}");
        }
    }

    #[test]
    fn backoff_respects_retry_after() {
        let config = RetryConfig::default();
        let d = backoff_delay_ms(0, ErrorClass::RateLimit, Some(12_000), &config, 0.5);
        assert_eq!(d, 12_000);
    }

    #[test]
    fn backoff_huge_retry_does_not_overflow() {
        let config = RetryConfig {
            max_delay_ms: u64::MAX,
            ..RetryConfig::default()
        };
        let _ = backoff_delay_ms(u32::MAX, ErrorClass::Transient, None, &config, 1.0);
    }

    #[test]
    fn config_rejects_unknown_keys() {
        assert!(serde_json::from_str::<RetryConfig>(r#"{"maxRetry": 1}"#).is_err());
        let c: RetryConfig = serde_json::from_str(r#"{"maxRetries": 1}"#).unwrap();
        assert_eq!(c.max_retries, 1);
        assert_eq!(c.rate_limit_floor_ms, 5000);
    }

    // -- with_retry --

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_retries_once() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry("embed", &fast_config(), None, None, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ClassifiedError::from_message("read ECONNRESET"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.summary.attempts, 2);
        assert_eq!(outcome.summary.retries, 1);
        assert_eq!(outcome.summary.delays_ms, vec![10]);
        assert_eq!(outcome.summary.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_is_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = with_retry("llm", &fast_config(), None, None, |_| {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClassifiedError::from_status(401, "invalid x-api-key")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_matches!(outcome.result, Err(ref e) if e.class == ErrorClass::Auth);
        assert_eq!(outcome.summary.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_max_retries() {
        let outcome: RetryOutcome<()> = with_retry("llm", &fast_config(), None, None, |_| async {
            Err(ClassifiedError::from_status(503, "unavailable"))
        })
        .await;

        assert_eq!(outcome.summary.attempts, 4);
        assert_eq!(outcome.summary.retries, 3);
        assert_eq!(outcome.summary.delays_ms, vec![10, 20, 40]);
        assert_eq!(outcome.summary.errors.len(), 4);
        assert!(outcome.result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_at_least_floor() {
        let stamps = Mutex::new(Vec::new());
        let outcome = with_retry("llm", &fast_config(), None, None, |n| {
            stamps.lock().push(Instant::now());
            async move {
                if n == 0 {
                    Err(ClassifiedError::from_status(429, "Too Many Requests"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] - stamps[0] >= Duration::from_millis(5000));
        assert!(outcome.summary.total_elapsed_ms >= 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_every_pause() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = move |event: &RetryEvent<'_>| {
            sink.lock()
                .push((event.attempt, event.delay_ms, event.context.to_string()));
        };
        let calls = AtomicU32::new(0);
        let _ = with_retry("batch-3", &fast_config(), None, Some(&observer), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClassifiedError::from_message("operation timed out"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![(1, 10, "batch-3".to_string()), (2, 20, "batch-3".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let config = RetryConfig {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast_config()
        };
        let _handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome: RetryOutcome<()> = with_retry("llm", &config, Some(&token), None, |_| async {
            Err(ClassifiedError::from_message("fetch failed"))
        })
        .await;

        assert_matches!(outcome.result, Err(ref e) if e.is_aborted());
        assert_eq!(outcome.summary.attempts, 1);
        assert!(outcome.summary.total_elapsed_ms < 60_000);
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = with_retry("llm", &fast_config(), Some(&token), None, |_| {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(outcome.result.unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn aborted_error_passes_through_unwrapped() {
        let outcome: RetryOutcome<()> = with_retry("llm", &fast_config(), None, None, |_| async {
            Err(ClassifiedError::cancelled("user stopped"))
        })
        .await;
        let err = outcome.result.unwrap_err();
        assert_eq!(err.code, "CANCELLED");
        assert_eq!(err.message, "user stopped");
    }
}

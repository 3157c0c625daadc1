//! Circuit breaking.
//!
//! [`with_circuit_breaker`] only consults a breaker; it never records
//! outcomes. Callers that own a breaker feed it results themselves, which
//! keeps the helper free of shared-state mutation.

use std::future::Future;
use std::time::Duration;

use encore_core::{ClassifiedError, ErrorClass};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Decides whether a call may proceed.
pub trait CircuitBreaker: Send + Sync {
    /// Whether the next call is admitted.
    fn admit(&self) -> bool;
}

impl<F> CircuitBreaker for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn admit(&self) -> bool {
        self()
    }
}

/// Run `op` if `breaker` admits it, otherwise fail with `CIRCUIT_OPEN`.
pub async fn with_circuit_breaker<B, T, F, Fut>(breaker: &B, op: F) -> Result<T, ClassifiedError>
where
    B: CircuitBreaker + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
{
    if !breaker.admit() {
        return Err(ClassifiedError::of(
            ErrorClass::CircuitOpen,
            "circuit open: call rejected",
        ));
    }
    op().await
}

// ─────────────────────────────────────────────────────────────────────────────
// ConsecutiveFailureBreaker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
}

/// N consecutive failures → open → cooldown → half-open → success → closed.
#[derive(Debug)]
pub struct ConsecutiveFailureBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl ConsecutiveFailureBreaker {
    /// Create a closed breaker.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Record a success; closes the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            inner.state = CircuitState::Closed;
        }
    }

    /// Record a failure; may trip the circuit.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let failures = inner.consecutive_failures;
        let trip = failures >= self.threshold || inner.state == CircuitState::HalfOpen;
        if trip && !matches!(inner.state, CircuitState::Open { .. }) {
            warn!(
                failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            inner.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Record the outcome of a call.
    pub fn record<T>(&self, result: &Result<T, ClassifiedError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.class == ErrorClass::CircuitOpen || e.is_aborted() => {}
            Err(_) => self.record_failure(),
        }
    }

    /// `closed`, `open` or `half_open`.
    pub fn state_name(&self) -> &'static str {
        match self.inner.lock().state {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn closure_breaker_rejects() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_circuit_breaker(&|| false, || async {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.code, "CIRCUIT_OPEN");
        assert_eq!(err.class, ErrorClass::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn admitted_call_runs() {
        let open = AtomicBool::new(false);
        let check = || !open.load(Ordering::SeqCst);
        let v = with_circuit_breaker(&check, || async { Ok::<_, ClassifiedError>(5) })
            .await
            .unwrap();
        assert_eq!(v, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_trip_and_recover() {
        let breaker = ConsecutiveFailureBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(breaker.admit());
            breaker.record_failure();
        }
        assert_eq!(breaker.state_name(), "open");
        assert!(!breaker.admit());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.admit());
        assert_eq!(breaker.state_name(), "half_open");

        breaker.record_success();
        assert_eq!(breaker.state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = ConsecutiveFailureBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.admit());
        breaker.record_failure();
        assert_eq!(breaker.state_name(), "open");
    }

    #[tokio::test]
    async fn helper_does_not_record() {
        let breaker = ConsecutiveFailureBreaker::new(1, Duration::from_secs(10));
        let result: Result<(), _> = with_circuit_breaker(&breaker, || async {
            Err(ClassifiedError::from_status(500, "boom"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(breaker.state_name(), "closed");

        breaker.record(&result);
        assert_eq!(breaker.state_name(), "open");
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = ConsecutiveFailureBreaker::new(2, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state_name(), "closed");
    }
}

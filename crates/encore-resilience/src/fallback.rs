//! Try alternatives in order until one succeeds.

use futures::future::BoxFuture;
use tracing::debug;

use encore_core::{ClassifiedError, ErrorClass};

/// One alternative for [`with_fallback`].
pub type FallbackFn<'a, T> =
    Box<dyn FnOnce() -> BoxFuture<'a, Result<T, ClassifiedError>> + Send + 'a>;

/// Run each alternative in order; return the first success.
///
/// When every alternative fails the last error is returned. An `aborted`
/// error stops the chain immediately. An empty list is `INVALID_STATE`.
pub async fn with_fallback<T>(fns: Vec<FallbackFn<'_, T>>) -> Result<T, ClassifiedError> {
    let total = fns.len();
    let mut last = None;
    for (index, f) in fns.into_iter().enumerate() {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_aborted() => return Err(err),
            Err(err) => {
                debug!(index, total, code = %err.code, "fallback alternative failed");
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        ClassifiedError::of(ErrorClass::InvalidState, "no fallback alternatives supplied")
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;

    use super::*;

    fn fails(msg: &'static str) -> FallbackFn<'static, u32> {
        Box::new(move || async move { Err(ClassifiedError::from_message(msg)) }.boxed())
    }

    fn succeeds(v: u32, calls: Arc<AtomicU32>) -> FallbackFn<'static, u32> {
        Box::new(move || {
            async move {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn first_success_wins() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_fallback(vec![
            fails("HTTP 503"),
            succeeds(7, Arc::clone(&calls)),
            succeeds(9, Arc::clone(&calls)),
        ])
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_fail_returns_last_error() {
        let err = with_fallback(vec![fails("HTTP 503"), fails("HTTP 401")])
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Auth);
    }

    #[tokio::test]
    async fn abort_stops_chain() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = with_fallback(vec![fails("request aborted"), succeeds(1, Arc::clone(&calls))])
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_is_invalid_state() {
        let err = with_fallback::<u32>(Vec::new()).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::InvalidState);
        assert_eq!(err.code, "INVALID_STATE");
    }
}

//! Turn queue behavior driven through the mock provider.

use std::sync::Arc;
use std::time::Duration;

use encore_core::{ApiKey, ClassifiedError, ErrorClass, TurnId};
use encore_resilience::BudgetManager;
use encore_runtime::{
    ChatResponse, MockProvider, MockReply, ProviderConfig, ProviderTurnHandler, TurnEvent,
    TurnOptions, TurnQueue, TurnQueueConfig,
};

fn queue_over(provider: Arc<MockProvider>) -> TurnQueue {
    let handler = ProviderTurnHandler::new(provider, ApiKey::new("sk-test-key"), ProviderConfig::default());
    TurnQueue::new(Arc::new(handler), BudgetManager::new(), TurnQueueConfig::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_in_flight_and_fifo_under_random_latency() {
    let provider = Arc::new(MockProvider::new().with_latency(0, 5));
    let queue = queue_over(provider.clone());
    let mut events = queue.subscribe();

    let handles: Vec<_> = (0..20)
        .map(|i| queue.push(format!("turn-{i}"), TurnOptions::default()))
        .collect();
    let submitted: Vec<TurnId> = handles.iter().map(|h| h.id().clone()).collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap();
        assert_eq!(response.content(), Some(format!("echo: turn-{i}").as_str()));
    }

    let mut completed = Vec::new();
    let mut processing = None;
    while completed.len() < 20 {
        match events.recv().await.unwrap() {
            TurnEvent::Processing { turn_id, .. } => {
                assert!(processing.is_none(), "two turns processing at once");
                processing = Some(turn_id);
            }
            TurnEvent::Completed { turn_id, .. } => {
                assert_eq!(processing.take().as_ref(), Some(&turn_id));
                completed.push(turn_id);
            }
            TurnEvent::Queued { .. } => {}
            TurnEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    assert_eq!(completed, submitted);
    assert_eq!(provider.max_in_flight(), 1);
    assert_eq!(provider.calls(), 20);
    assert_eq!(queue.metrics().total_processed, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_never_overlap() {
    let provider = Arc::new(MockProvider::new().with_latency(1, 3));
    let queue = queue_over(provider.clone());

    let submitters: Vec<_> = (0..4)
        .map(|s| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let handles: Vec<_> = (0..5)
                    .map(|i| queue.push(format!("s{s}-{i}"), TurnOptions::default()))
                    .collect();
                let mut ok = 0;
                for handle in handles {
                    if handle.await.is_ok() {
                        ok += 1;
                    }
                }
                ok
            })
        })
        .collect();

    let mut total = 0;
    for submitter in submitters {
        total += submitter.await.unwrap();
    }
    assert_eq!(total, 20);
    assert_eq!(provider.max_in_flight(), 1);
    assert!(queue.metrics().max_depth >= 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_retry_waits_for_the_floor() {
    let provider = Arc::new(MockProvider::new());
    provider.push_error(ClassifiedError::from_status(429, "Too Many Requests"));
    provider.push_response(ChatResponse::text("you mostly played jazz in 2019"));
    let queue = queue_over(provider.clone());
    let mut events = queue.subscribe();

    let response = queue.push("what did I listen to?", TurnOptions::default()).await.unwrap();
    assert_eq!(response.content(), Some("you mostly played jazz in 2019"));

    let times = provider.call_times();
    assert_eq!(times.len(), 2);
    assert!(times[1] - times[0] >= Duration::from_secs(5));

    loop {
        if let TurnEvent::Completed { retries, .. } = events.recv().await.unwrap() {
            assert_eq!(retries, 1);
            break;
        }
    }
}

#[tokio::test]
async fn failed_turn_does_not_block_the_next() {
    let provider = Arc::new(MockProvider::new());
    provider.push_error(ClassifiedError::from_status(401, "invalid api key sk-test-key"));
    let queue = queue_over(provider.clone());

    let first = queue.push("first", TurnOptions::default());
    let second = queue.push("second", TurnOptions::default());

    let err = first.await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Auth);
    assert_eq!(second.await.unwrap().content(), Some("echo: second"));
    assert_eq!(provider.calls(), 2);

    let m = queue.metrics();
    assert_eq!(m.total_processed, 2);
    assert_eq!(m.total_failed, 1);
    assert!((m.success_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn slow_provider_hits_the_turn_budget() {
    let provider = Arc::new(MockProvider::new());
    provider.push_reply(MockReply {
        delay: Duration::from_secs(120),
        result: Ok(ChatResponse::text("too late")),
    });
    let queue = queue_over(provider.clone());

    let err = queue.push("slow", TurnOptions::default()).await.unwrap_err();
    assert_eq!(err.code, "BUDGET_EXCEEDED");

    let next = queue.push("fast", TurnOptions::default()).await.unwrap();
    assert_eq!(next.content(), Some("echo: fast"));
}

#[tokio::test(start_paused = true)]
async fn retry_can_be_disabled_per_turn() {
    let provider = Arc::new(MockProvider::new());
    provider.push_error(ClassifiedError::from_status(503, "unavailable"));
    let queue = queue_over(provider.clone());

    let options = TurnOptions {
        retry: Some(false),
        ..TurnOptions::default()
    };
    let err = queue.push("once", options).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::ServerError);
    assert_eq!(provider.calls(), 1);
}

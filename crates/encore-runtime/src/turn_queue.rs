//! # Turn queue
//!
//! Serializes conversational turns so at most one LLM exchange is in flight.
//!
//! - Submission order is processing order.
//! - Selection is an atomic check-and-set on `is_processing`; the winner pops
//!   the head turn and spawns its driver. Every driver owns a release guard
//!   that clears the flag and re-runs selection on drop, so success, failure,
//!   cancellation, and handler panics all hand the queue to the next turn.
//! - Each turn runs under a time budget and, unless disabled, under
//!   classified retry.
//! - Every outcome is delivered to the submitter through its [`TurnHandle`].

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_core::{ClassifiedError, ErrorClass, TurnId, redact_secrets};
use encore_resilience::{BudgetDefaults, BudgetManager, RetryConfig, RetryEvent, with_retry};
use encore_settings::EncoreSettings;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provider::ChatResponse;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Queue-level failures delivered to submitters.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnQueueError {
    /// The turn was dropped by `clear_pending` or `shutdown` before it ran.
    #[error("turn cancelled before processing")]
    Cancelled,
    /// The in-flight turn was interrupted by `shutdown`.
    #[error("turn interrupted by shutdown")]
    Interrupted,
    /// The queue no longer accepts turns.
    #[error("turn queue is shut down")]
    ShutDown,
    /// The handler panicked.
    #[error("turn handler panicked: {0}")]
    Panicked(String),
    /// The queue went away without answering.
    #[error("turn dropped without a result")]
    Dropped,
}

impl TurnQueueError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cancelled | Self::Interrupted => "CANCELLED",
            Self::ShutDown => "QUEUE_SHUT_DOWN",
            Self::Panicked(_) => "TURN_PANICKED",
            Self::Dropped => "TURN_DROPPED",
        }
    }

    /// Taxonomy class.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Cancelled | Self::Interrupted => ErrorClass::Aborted,
            Self::ShutDown => ErrorClass::InvalidState,
            Self::Panicked(_) | Self::Dropped => ErrorClass::Unknown,
        }
    }
}

impl From<TurnQueueError> for ClassifiedError {
    fn from(err: TurnQueueError) -> Self {
        ClassifiedError::new(err.class(), err.code(), err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-turn overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TurnOptions {
    /// Budget for this turn instead of the queue default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_ms: Option<u64>,
    /// Enable or disable retry for this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
}

/// Queue configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TurnQueueConfig {
    /// Broadcast channel capacity.
    pub event_capacity: usize,
    /// Retry retryable failures by default.
    pub retry_turns: bool,
    /// Retry parameters.
    pub retry: RetryConfig,
    /// Default per-turn budget.
    pub llm_turn_ms: u64,
}

impl Default for TurnQueueConfig {
    fn default() -> Self {
        Self::from_settings(&EncoreSettings::default())
    }
}

impl TurnQueueConfig {
    /// Build from the `turnQueue`, `retry`, and `budgets` sections.
    pub fn from_settings(settings: &EncoreSettings) -> Self {
        Self {
            event_capacity: settings.turn_queue.event_capacity,
            retry_turns: settings.turn_queue.retry_turns,
            retry: RetryConfig::from_settings(&settings.retry),
            llm_turn_ms: BudgetDefaults::from_settings(&settings.budgets).llm_turn_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turns
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a turn. Terminal states are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// Waiting in the queue.
    Queued,
    /// Being handled.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Handler failed or the turn was cancelled.
    Failed,
}

/// A submitted turn. Only the queue changes its state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    /// Turn id.
    pub id: TurnId,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// User message.
    pub message: String,
    /// Per-turn overrides.
    pub options: TurnOptions,
    /// Current state.
    pub state: TurnState,
    /// Response once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ChatResponse>,
    /// Error once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
}

impl Turn {
    fn new(message: String, options: TurnOptions) -> Self {
        Self {
            id: TurnId::new(),
            submitted_at: Utc::now(),
            message,
            options,
            state: TurnState::Queued,
            result: None,
            error: None,
        }
    }

    fn finish(&mut self, outcome: Result<ChatResponse, ClassifiedError>) {
        match outcome {
            Ok(response) => {
                self.state = TurnState::Completed;
                self.result = Some(response);
            }
            Err(err) => {
                self.state = TurnState::Failed;
                self.error = Some(err);
            }
        }
    }

    fn into_outcome(self) -> Result<ChatResponse, ClassifiedError> {
        match (self.result, self.error) {
            (Some(response), _) => Ok(response),
            (None, Some(err)) => Err(err),
            (None, None) => Err(TurnQueueError::Dropped.into()),
        }
    }
}

/// What a handler sees of the turn it is processing.
#[derive(Clone, Debug)]
pub struct TurnContext {
    /// Turn id.
    pub id: TurnId,
    /// User message.
    pub message: String,
    /// Per-turn overrides.
    pub options: TurnOptions,
    /// Fires when the queue shuts down mid-turn.
    pub cancel: CancellationToken,
}

/// Performs the LLM exchange for one turn.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    /// Handle one attempt (zero-based) of a turn.
    async fn handle(&self, turn: &TurnContext, attempt: u32) -> Result<ChatResponse, ClassifiedError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Events, status, metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Queue lifecycle event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A turn entered the queue.
    Queued {
        /// Turn id.
        turn_id: TurnId,
        /// Pending turns including this one.
        depth: usize,
    },
    /// A turn started processing.
    Processing {
        /// Turn id.
        turn_id: TurnId,
        /// Time spent queued.
        wait_ms: u64,
    },
    /// A turn completed.
    Completed {
        /// Turn id.
        turn_id: TurnId,
        /// Processing time.
        duration_ms: u64,
        /// Retries performed.
        retries: u32,
    },
    /// A turn failed or was cancelled.
    Failed {
        /// Turn id.
        turn_id: TurnId,
        /// The error delivered to the submitter.
        error: ClassifiedError,
    },
}

/// Point-in-time queue status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Turns waiting.
    pub pending: usize,
    /// Whether a turn is in flight.
    pub is_processing: bool,
    /// Id of the in-flight turn.
    pub current_turn_id: Option<TurnId>,
}

/// Aggregate queue metrics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    /// Turns that reached a terminal state through processing.
    pub total_processed: u64,
    /// Processed turns that failed.
    pub total_failed: u64,
    /// Share of processed turns that completed; 1.0 before any.
    pub success_rate: f64,
    /// Mean time spent queued.
    pub avg_wait_ms: f64,
    /// Mean processing time.
    pub avg_processing_ms: f64,
    /// Largest pending depth observed.
    pub max_depth: usize,
}

#[derive(Debug, Default)]
struct Stats {
    processed: u64,
    failed: u64,
    wait_ms: u64,
    processing_ms: u64,
    max_depth: usize,
}

impl Stats {
    fn snapshot(&self) -> QueueMetrics {
        let avg = |total: u64| {
            if self.processed == 0 {
                0.0
            } else {
                total as f64 / self.processed as f64
            }
        };
        QueueMetrics {
            total_processed: self.processed,
            total_failed: self.failed,
            success_rate: if self.processed == 0 {
                1.0
            } else {
                (self.processed - self.failed) as f64 / self.processed as f64
            },
            avg_wait_ms: avg(self.wait_ms),
            avg_processing_ms: avg(self.processing_ms),
            max_depth: self.max_depth,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TurnHandle
// ─────────────────────────────────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<ChatResponse, ClassifiedError>>;

/// Resolves with the turn's response or its classified error.
#[derive(Debug)]
pub struct TurnHandle {
    id: TurnId,
    rx: oneshot::Receiver<Result<ChatResponse, ClassifiedError>>,
}

impl TurnHandle {
    /// Id of the submitted turn.
    pub fn id(&self) -> &TurnId {
        &self.id
    }
}

impl Future for TurnHandle {
    type Output = Result<ChatResponse, ClassifiedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(TurnQueueError::Dropped.into())))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TurnQueue
// ─────────────────────────────────────────────────────────────────────────────

struct PendingTurn {
    turn: Turn,
    reply: Reply,
    enqueued: Instant,
}

struct Inner {
    handler: Arc<dyn TurnHandler>,
    budgets: BudgetManager,
    config: TurnQueueConfig,
    pending: Mutex<VecDeque<PendingTurn>>,
    pending_len: AtomicUsize,
    is_processing: AtomicBool,
    current: ArcSwapOption<TurnId>,
    shutdown: CancellationToken,
    events: broadcast::Sender<TurnEvent>,
    stats: Mutex<Stats>,
}

impl Inner {
    fn emit(&self, event: TurnEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Single-writer FIFO turn queue. Cheap to clone; clones share the queue.
///
/// Must be used inside a tokio runtime: every turn runs on a spawned task.
#[derive(Clone)]
pub struct TurnQueue {
    inner: Arc<Inner>,
}

impl TurnQueue {
    /// Create an idle queue.
    pub fn new(handler: Arc<dyn TurnHandler>, budgets: BudgetManager, config: TurnQueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                handler,
                budgets,
                config,
                pending: Mutex::new(VecDeque::new()),
                pending_len: AtomicUsize::new(0),
                is_processing: AtomicBool::new(false),
                current: ArcSwapOption::empty(),
                shutdown: CancellationToken::new(),
                events,
                stats: Mutex::new(Stats::default()),
            }),
        }
    }

    /// Submit a turn.
    pub fn push(&self, message: impl Into<String>, options: TurnOptions) -> TurnHandle {
        let turn = Turn::new(message.into(), options);
        let id = turn.id.clone();
        let (reply, rx) = oneshot::channel();

        if self.inner.shutdown.is_cancelled() {
            let _ = reply.send(Err(TurnQueueError::ShutDown.into()));
            return TurnHandle { id, rx };
        }

        let depth = {
            let mut pending = self.inner.pending.lock();
            pending.push_back(PendingTurn {
                turn,
                reply,
                enqueued: Instant::now(),
            });
            let depth = pending.len();
            self.inner.pending_len.store(depth, Ordering::SeqCst);
            depth
        };
        {
            let mut stats = self.inner.stats.lock();
            stats.max_depth = stats.max_depth.max(depth);
        }
        debug!(turn_id = %id, depth, "turn queued");
        self.inner.emit(TurnEvent::Queued {
            turn_id: id.clone(),
            depth,
        });

        process_next(&self.inner);
        TurnHandle { id, rx }
    }

    /// Reject every queued turn with `CANCELLED`. The in-flight turn is not
    /// affected. Returns the number of turns dropped.
    pub fn clear_pending(&self) -> usize {
        let drained: Vec<PendingTurn> = {
            let mut pending = self.inner.pending.lock();
            self.inner.pending_len.store(0, Ordering::SeqCst);
            pending.drain(..).collect()
        };
        let count = drained.len();
        for PendingTurn { mut turn, reply, .. } in drained {
            let err: ClassifiedError = TurnQueueError::Cancelled.into();
            self.inner.emit(TurnEvent::Failed {
                turn_id: turn.id.clone(),
                error: err.clone(),
            });
            turn.finish(Err(err));
            let _ = reply.send(turn.into_outcome());
            metrics::counter!("turn_queue_turns_total", "outcome" => "cancelled").increment(1);
        }
        if count > 0 {
            info!(count, "cleared pending turns");
        }
        count
    }

    /// Stop accepting turns, interrupt the in-flight turn, and reject the
    /// pending ones.
    pub fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        self.clear_pending()
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Current status.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.inner.pending_len.load(Ordering::SeqCst),
            is_processing: self.inner.is_processing.load(Ordering::SeqCst),
            current_turn_id: self.inner.current.load_full().map(|id| (*id).clone()),
        }
    }

    /// Snapshot of the queued turns in order.
    pub fn pending_turns(&self) -> Vec<Turn> {
        self.inner.pending.lock().iter().map(|p| p.turn.clone()).collect()
    }

    /// Aggregate metrics.
    pub fn metrics(&self) -> QueueMetrics {
        self.inner.stats.lock().snapshot()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.inner.events.subscribe()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Selection and release
// ─────────────────────────────────────────────────────────────────────────────

/// Start the head turn unless one is already in flight.
fn process_next(inner: &Arc<Inner>) {
    loop {
        if inner
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let next = {
            let mut pending = inner.pending.lock();
            let next = pending.pop_front();
            inner.pending_len.store(pending.len(), Ordering::SeqCst);
            next
        };

        let Some(next) = next else {
            inner.is_processing.store(false, Ordering::SeqCst);
            // a push may have landed between the pop and the release
            if inner.pending_len.load(Ordering::SeqCst) == 0 {
                return;
            }
            continue;
        };

        inner.current.store(Some(Arc::new(next.turn.id.clone())));
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(turn_id = %next.turn.id, "no tokio runtime; turn dropped");
            inner.current.store(None);
            inner.is_processing.store(false, Ordering::SeqCst);
            return;
        };
        let release = ReleaseGuard(Arc::clone(inner));
        let _ = runtime.spawn(async move {
            let guard = release;
            run_turn(&guard.0, next).await;
        });
        return;
    }
}

/// Clears the in-flight slot and selects the next turn on every exit path.
struct ReleaseGuard(Arc<Inner>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.current.store(None);
        self.0.is_processing.store(false, Ordering::SeqCst);
        process_next(&self.0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn execution
// ─────────────────────────────────────────────────────────────────────────────

async fn run_turn(inner: &Inner, pending: PendingTurn) {
    let PendingTurn {
        mut turn,
        reply,
        enqueued,
    } = pending;
    let wait_ms = enqueued.elapsed().as_millis() as u64;
    turn.state = TurnState::Processing;
    inner.emit(TurnEvent::Processing {
        turn_id: turn.id.clone(),
        wait_ms,
    });

    let ctx = TurnContext {
        id: turn.id.clone(),
        message: turn.message.clone(),
        options: turn.options.clone(),
        cancel: inner.shutdown.child_token(),
    };
    let started = Instant::now();
    let outcome = execute(inner, &ctx).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    {
        let mut stats = inner.stats.lock();
        stats.processed += 1;
        stats.wait_ms += wait_ms;
        stats.processing_ms += duration_ms;
        if outcome.is_err() {
            stats.failed += 1;
        }
    }

    let outcome = match outcome {
        Ok((response, retries)) => {
            info!(turn_id = %turn.id, duration_ms, retries, "turn completed");
            metrics::counter!("turn_queue_turns_total", "outcome" => "completed").increment(1);
            inner.emit(TurnEvent::Completed {
                turn_id: turn.id.clone(),
                duration_ms,
                retries,
            });
            Ok(response)
        }
        Err(err) => {
            warn!(
                turn_id = %turn.id,
                code = %err.code,
                error = %redact_secrets(&err.message),
                "turn failed"
            );
            metrics::counter!("turn_queue_turns_total", "outcome" => "failed").increment(1);
            inner.emit(TurnEvent::Failed {
                turn_id: turn.id.clone(),
                error: err.clone(),
            });
            Err(err)
        }
    };

    turn.finish(outcome);
    if reply.send(turn.into_outcome()).is_err() {
        debug!("turn submitter went away before the result");
    }
}

/// Budget, then retry, then the handler; interrupted by shutdown.
async fn execute(inner: &Inner, ctx: &TurnContext) -> Result<(ChatResponse, u32), ClassifiedError> {
    let retry = if ctx.options.retry.unwrap_or(inner.config.retry_turns) {
        inner.config.retry.clone()
    } else {
        RetryConfig::no_retry()
    };
    let budget_ms = ctx.options.budget_ms.unwrap_or(inner.config.llm_turn_ms);
    let handler = inner.handler.as_ref();
    let turn_id = ctx.id.as_str();
    let observer = |event: &RetryEvent<'_>| {
        warn!(
            turn_id,
            attempt = event.attempt,
            delay_ms = event.delay_ms,
            code = %event.error.code,
            "retrying turn"
        );
    };

    let attempts = async {
        let outcome = with_retry("llm_turn", &retry, Some(&ctx.cancel), Some(&observer), |attempt| {
            call_handler(handler, ctx, attempt)
        })
        .await;
        let retries = outcome.summary.retries;
        outcome.result.map(|response| (response, retries))
    };

    tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(TurnQueueError::Interrupted.into()),
        result = inner.budgets.with_budget("llm_turn", budget_ms, attempts) => result,
    }
}

async fn call_handler(
    handler: &dyn TurnHandler,
    ctx: &TurnContext,
    attempt: u32,
) -> Result<ChatResponse, ClassifiedError> {
    match AssertUnwindSafe(handler.handle(ctx, attempt)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(turn_id = %ctx.id, attempt, panic = %message, "turn handler panicked");
            Err(TurnQueueError::Panicked(message).into())
        }
    }
}

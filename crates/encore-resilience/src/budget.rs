//! Per-operation time budgets.
//!
//! Budgets are allocated and released explicitly because they often span
//! component boundaries (a turn budget covers provider retries and tool
//! calls). [`BudgetManager::with_budget`] is the scoped convenience: it
//! allocates, enforces the deadline with `tokio::time::timeout`, and
//! releases on every exit path including cancellation of the future.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use encore_core::{BudgetId, ClassifiedError, ErrorClass};
use encore_settings::BudgetSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Error code for an exceeded budget.
pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default budgets for the operations the core runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BudgetDefaults {
    /// One LLM turn.
    pub llm_turn_ms: u64,
    /// One tool/function call.
    pub tool_call_ms: u64,
    /// Embedding model initialization.
    pub embedding_init_ms: u64,
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self::from_settings(&BudgetSettings::default())
    }
}

impl BudgetDefaults {
    /// Build from the `budgets` settings section.
    pub fn from_settings(settings: &BudgetSettings) -> Self {
        Self {
            llm_turn_ms: settings.llm_turn_ms,
            tool_call_ms: settings.tool_call_ms,
            embedding_init_ms: settings.embedding_init_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TimeBudget
// ─────────────────────────────────────────────────────────────────────────────

/// A time allowance for one operation.
#[derive(Clone, Debug)]
pub struct TimeBudget {
    id: BudgetId,
    operation: String,
    budget: Duration,
    started: Instant,
}

impl TimeBudget {
    fn new(operation: &str, budget_ms: u64) -> Self {
        Self {
            id: BudgetId::new(),
            operation: operation.to_owned(),
            budget: Duration::from_millis(budget_ms),
            started: Instant::now(),
        }
    }

    /// Handle id.
    pub fn id(&self) -> &BudgetId {
        &self.id
    }

    /// Operation label.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Allowance in milliseconds.
    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }

    /// When accounting started.
    pub fn start_time(&self) -> Instant {
        self.started
    }

    /// Time spent so far.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, zero once exhausted.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Whether the allowance is used up.
    pub fn is_exhausted(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// The timeout error for this budget.
    pub fn exceeded_error(&self) -> ClassifiedError {
        ClassifiedError::new(
            ErrorClass::Timeout,
            BUDGET_EXCEEDED,
            format!("{} exceeded its {} ms budget", self.operation, self.budget_ms()),
        )
        .with_context("operation", self.operation.clone())
        .with_context("budgetMs", self.budget_ms())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BudgetManager
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks active budgets. Cheap to clone; clones share state.
#[derive(Clone, Debug, Default)]
pub struct BudgetManager {
    active: Arc<Mutex<HashMap<BudgetId, TimeBudget>>>,
}

impl BudgetManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accounting for `operation`.
    pub fn allocate(&self, operation: &str, budget_ms: u64) -> TimeBudget {
        let budget = TimeBudget::new(operation, budget_ms);
        let _ = self.active.lock().insert(budget.id.clone(), budget.clone());
        debug!(operation, budget_ms, id = %budget.id, "budget allocated");
        budget
    }

    /// End accounting. Returns the elapsed time, or `None` if the handle was
    /// already released.
    pub fn release(&self, budget: &TimeBudget) -> Option<Duration> {
        let removed = self.active.lock().remove(&budget.id)?;
        let elapsed = removed.elapsed();
        if elapsed > removed.budget {
            warn!(
                operation = %removed.operation,
                budget_ms = removed.budget_ms(),
                elapsed_ms = elapsed.as_millis() as u64,
                "operation overran its budget"
            );
        }
        Some(elapsed)
    }

    /// Snapshot of active budgets.
    pub fn active(&self) -> Vec<TimeBudget> {
        self.active.lock().values().cloned().collect()
    }

    /// Number of active budgets.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Sum of active allowances. Nested sub-operations add up.
    pub fn total_allocated_ms(&self) -> u64 {
        self.active.lock().values().map(TimeBudget::budget_ms).sum()
    }

    /// Run `fut` under a fresh budget; time out with `BUDGET_EXCEEDED`.
    pub async fn with_budget<T, Fut>(
        &self,
        operation: &str,
        budget_ms: u64,
        fut: Fut,
    ) -> Result<T, ClassifiedError>
    where
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let guard = BudgetGuard {
            manager: self,
            budget: self.allocate(operation, budget_ms),
        };
        match tokio::time::timeout(guard.budget.budget, fut).await {
            Ok(result) => result,
            Err(_) => {
                let err = guard.budget.exceeded_error();
                warn!(operation, budget_ms, "budget exceeded");
                Err(err)
            }
        }
    }
}

/// Releases on drop so a cancelled `with_budget` future still cleans up.
struct BudgetGuard<'a> {
    manager: &'a BudgetManager,
    budget: TimeBudget,
}

impl Drop for BudgetGuard<'_> {
    fn drop(&mut self) {
        let _ = self.manager.release(&self.budget);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_match_settings() {
        let d = BudgetDefaults::default();
        assert_eq!(d.llm_turn_ms, 60_000);
        assert_eq!(d.tool_call_ms, 10_000);
        assert_eq!(d.embedding_init_ms, 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_and_exhaustion_follow_clock() {
        let mgr = BudgetManager::new();
        let b = mgr.allocate("llm_turn", 1000);
        assert_eq!(b.remaining(), Duration::from_millis(1000));
        assert!(!b.is_exhausted());

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(b.elapsed(), Duration::from_millis(400));
        assert_eq!(b.remaining(), Duration::from_millis(600));

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(b.is_exhausted());
        assert_eq!(b.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn release_is_explicit_and_once() {
        let mgr = BudgetManager::new();
        let b = mgr.allocate("tool", 10);
        assert_eq!(mgr.active_count(), 1);
        assert!(mgr.release(&b).is_some());
        assert!(mgr.release(&b).is_none());
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn nested_budgets_are_additive() {
        let mgr = BudgetManager::new();
        let outer = mgr.allocate("turn", 60_000);
        let inner = mgr.allocate("tool", 10_000);
        assert_eq!(mgr.total_allocated_ms(), 70_000);
        let _ = mgr.release(&inner);
        assert_eq!(mgr.total_allocated_ms(), 60_000);
        let _ = mgr.release(&outer);
    }

    #[tokio::test(start_paused = true)]
    async fn with_budget_times_out() {
        let mgr = BudgetManager::new();
        let result: Result<(), _> = mgr
            .with_budget("llm_turn", 50, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_matches!(result, Err(ref e) if e.code == BUDGET_EXCEEDED && e.class == ErrorClass::Timeout);
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn with_budget_releases_on_error_and_success() {
        let mgr = BudgetManager::new();
        let ok: Result<u8, _> = mgr.with_budget("a", 1000, async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: Result<u8, _> = mgr
            .with_budget("b", 1000, async { Err(ClassifiedError::from_message("boom")) })
            .await;
        assert!(err.is_err());
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_future_releases_budget() {
        let mgr = BudgetManager::new();
        let fut = mgr.with_budget("turn", 60_000, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ClassifiedError>(())
        });
        let raced = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(raced.is_err());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn exceeded_error_carries_context() {
        let b = TimeBudget::new("embedding_init", 60_000);
        let err = b.exceeded_error();
        assert_eq!(err.context["operation"], "embedding_init");
        assert_eq!(err.context["budgetMs"], 60_000);
        assert!(err.is_retryable());
    }
}

//! # encore-resilience
//!
//! Timeout budgets and classified-error retry, consumed by the embedding
//! task manager and the turn queue.
//!
//! - [`retry`]: backoff math and the async [`with_retry`] executor
//! - [`budget`]: explicit per-operation [`TimeBudget`]s and [`BudgetManager::with_budget`]
//! - [`fallback`]: try alternatives in order
//! - [`circuit`]: consult a breaker before running an operation

#![deny(unsafe_code)]

pub mod budget;
pub mod circuit;
pub mod fallback;
pub mod retry;

pub use budget::{BudgetDefaults, BudgetManager, TimeBudget};
pub use circuit::{CircuitBreaker, ConsecutiveFailureBreaker, with_circuit_breaker};
pub use fallback::{FallbackFn, with_fallback};
pub use retry::{
    RetryConfig, RetryEvent, RetryObserver, RetryOutcome, RetrySummary, backoff_delay_ms,
    with_retry,
};

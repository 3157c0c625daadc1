//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Every section is
//! `#[serde(default, deny_unknown_fields)]`: partial JSON is filled from
//! [`Default`], misspelled keys are rejected instead of silently ignored.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Root settings type.
///
/// ```json
/// {
///   "embedding": { "batchSize": 64 },
///   "retry": { "maxRetries": 5 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EncoreSettings {
    /// Embedding task settings.
    pub embedding: EmbeddingSettings,
    /// Vector search defaults.
    pub search: SearchSettings,
    /// Retry policy.
    pub retry: RetrySettings,
    /// Per-operation time budgets.
    pub budgets: BudgetSettings,
    /// Small/large value store settings.
    pub storage: StorageSettings,
    /// Turn queue settings.
    pub turn_queue: TurnQueueSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl EncoreSettings {
    /// Reject values no component can operate with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 9] = [
            (self.embedding.batch_size == 0, "embedding.batchSize must be > 0"),
            (
                self.embedding.checkpoint_interval == 0,
                "embedding.checkpointInterval must be > 0",
            ),
            (
                self.embedding.inline_threshold_bytes == 0,
                "embedding.inlineThresholdBytes must be > 0",
            ),
            (self.embedding.dimensions == 0, "embedding.dimensions must be > 0"),
            (self.embedding.id_prefix.is_empty(), "embedding.idPrefix must not be empty"),
            (
                self.search.default_threshold.is_nan(),
                "search.defaultThreshold must be a number",
            ),
            (
                self.retry.base_delay_ms > self.retry.max_delay_ms,
                "retry.baseDelayMs must not exceed retry.maxDelayMs",
            ),
            (self.budgets.llm_turn_ms == 0, "budgets.llmTurnMs must be > 0"),
            (self.turn_queue.event_capacity == 0, "turnQueue.eventCapacity must be > 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(SettingsError::InvalidValue((*msg).to_string())),
            None => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding task settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EmbeddingSettings {
    /// Items per batch.
    pub batch_size: usize,
    /// Write a checkpoint every N batches.
    pub checkpoint_interval: usize,
    /// Serialized texts larger than this go to the large-value store.
    pub inline_threshold_bytes: u64,
    /// Expected embedding dimension.
    pub dimensions: usize,
    /// Prefix for generated vector record ids.
    pub id_prefix: String,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            checkpoint_interval: 1,
            inline_threshold_bytes: MIB,
            dimensions: 384,
            id_prefix: "chunk".to_string(),
        }
    }
}

/// Vector search defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SearchSettings {
    /// Default top-K.
    pub default_limit: usize,
    /// Default similarity threshold.
    pub default_threshold: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_limit: 5,
            default_threshold: 0.3,
        }
    }
}

/// Retry policy settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay.
    pub base_delay_ms: u64,
    /// Backoff ceiling (before jitter).
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub jitter_ms: u64,
    /// Minimum delay after a rate-limit error.
    pub rate_limit_floor_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 200,
            rate_limit_floor_ms: 5000,
        }
    }
}

/// Default per-operation time budgets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BudgetSettings {
    /// One LLM turn.
    pub llm_turn_ms: u64,
    /// One tool/function call.
    pub tool_call_ms: u64,
    /// Embedding model initialization.
    pub embedding_init_ms: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            llm_turn_ms: 60_000,
            tool_call_ms: 10_000,
            embedding_init_ms: 60_000,
        }
    }
}

/// Value store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct StorageSettings {
    /// Quota of the small-value store.
    pub small_quota_bytes: u64,
    /// `SQLite` file backing the large-value store; in-memory when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_db_path: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            small_quota_bytes: 5 * MIB,
            large_db_path: None,
        }
    }
}

/// Turn queue settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TurnQueueSettings {
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// Retry retryable LLM failures inside a turn.
    pub retry_turns: bool,
}

impl Default for TurnQueueSettings {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            retry_turns: true,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Minimum level (`trace`..`error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

//! Split checkpoint persistence.
//!
//! Metadata lives in the small store under [`META_KEY`]. The ordered texts
//! payload is inlined in the metadata while its serialized form stays under
//! the inline threshold, otherwise it is written once per task to the large
//! store under [`TEXTS_KEY`] and the metadata records
//! `textsStoredInLarge = true`.
//!
//! Readers also accept the legacy single-key shape under [`LEGACY_KEY`];
//! writers only emit the split shape and drop the legacy key afterwards.

use std::sync::Arc;

use encore_core::{ErrorClass, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::{LargeValueStore, SmallValueStore, StoreError};

/// Small-store key of the checkpoint metadata.
pub const META_KEY: &str = "checkpoint_meta";
/// Large-store key of the texts payload.
pub const TEXTS_KEY: &str = "checkpoint_texts";
/// Small-store key of the pre-split checkpoint shape.
pub const LEGACY_KEY: &str = "checkpoint";

/// Checkpoint errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Persisted state fails validation; left untouched for inspection.
    #[error("checkpoint corrupt: {0}")]
    Corrupt(String),

    /// Writing the checkpoint failed.
    #[error("checkpoint write failed: {source}")]
    WriteFailed {
        /// Underlying store error.
        source: StoreError,
    },

    /// Reading the checkpoint failed.
    #[error("checkpoint read failed: {0}")]
    Read(StoreError),
}

impl CheckpointError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Corrupt(_) => "CHECKPOINT_CORRUPT",
            Self::WriteFailed { .. } => "CHECKPOINT_WRITE_FAILED",
            Self::Read(_) => "CHECKPOINT_READ_FAILED",
        }
    }

    /// Taxonomy class.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Corrupt(_) => ErrorClass::InvalidState,
            Self::WriteFailed { source } | Self::Read(source) => source.class(),
        }
    }
}

fn write_failed(source: StoreError) -> CheckpointError {
    CheckpointError::WriteFailed { source }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted checkpoint metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    /// Items completed so far.
    pub processed_count: usize,
    /// Corpus size.
    pub total_count: usize,
    /// Where the next batch starts.
    pub next_index: usize,
    /// Completed corpus indices.
    pub processed_indices: Vec<usize>,
    /// Task that wrote the checkpoint.
    pub task_id: TaskId,
    /// Whether the texts live in the large store.
    #[serde(default)]
    pub texts_stored_in_large: bool,
    /// Number of texts in the payload.
    #[serde(default)]
    pub texts_count: usize,
    /// RFC 3339 write time.
    #[serde(default)]
    pub timestamp: String,
    /// Inlined texts; absent when stored in the large store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texts: Option<Vec<String>>,
}

impl CheckpointMeta {
    /// Metadata for a task that has completed `processed_indices`.
    pub fn new(task_id: TaskId, total_count: usize, next_index: usize, processed_indices: Vec<usize>) -> Self {
        Self {
            processed_count: processed_indices.len(),
            total_count,
            next_index,
            processed_indices,
            task_id,
            texts_stored_in_large: false,
            texts_count: total_count,
            timestamp: String::new(),
            texts: None,
        }
    }

    fn validate(&self, texts: &[String]) -> Result<(), CheckpointError> {
        let failure = if texts.len() != self.texts_count {
            Some(format!(
                "texts length {} does not match textsCount {}",
                texts.len(),
                self.texts_count
            ))
        } else if self.processed_count > self.total_count {
            Some(format!(
                "processedCount {} exceeds totalCount {}",
                self.processed_count, self.total_count
            ))
        } else if self.processed_indices.len() != self.processed_count {
            Some(format!(
                "processedIndices length {} does not match processedCount {}",
                self.processed_indices.len(),
                self.processed_count
            ))
        } else if texts.len() != self.total_count {
            Some(format!(
                "texts length {} does not match totalCount {}",
                texts.len(),
                self.total_count
            ))
        } else if self.next_index > self.total_count {
            Some(format!(
                "nextIndex {} outside corpus of {}",
                self.next_index, self.total_count
            ))
        } else {
            self.index_failure()
        };
        match failure {
            Some(msg) => Err(CheckpointError::Corrupt(msg)),
            None => Ok(()),
        }
    }

    /// Every index below `nextIndex` must be recorded exactly once, and none
    /// may fall outside the corpus.
    fn index_failure(&self) -> Option<String> {
        let mut seen = vec![false; self.total_count];
        for &index in &self.processed_indices {
            let Some(slot) = seen.get_mut(index) else {
                return Some(format!(
                    "processed index {index} outside corpus of {}",
                    self.total_count
                ));
            };
            if std::mem::replace(slot, true) {
                return Some(format!("processed index {index} recorded twice"));
            }
        }
        seen[..self.next_index]
            .iter()
            .position(|done| !done)
            .map(|gap| format!("index {gap} below nextIndex {} was never processed", self.next_index))
    }
}

/// A validated checkpoint with its texts materialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedCheckpoint {
    /// Metadata, with `texts` cleared.
    pub meta: CheckpointMeta,
    /// The ordered corpus.
    pub texts: Vec<String>,
}

/// Where a save put the texts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextsLocation {
    /// Inlined in the metadata.
    Inline,
    /// In the large store.
    Large,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Reads and writes the split checkpoint.
#[derive(Clone)]
pub struct CheckpointStore {
    small: Arc<dyn SmallValueStore>,
    large: Arc<dyn LargeValueStore>,
    inline_threshold: u64,
    /// `(task, texts_count)` already present in the large store.
    written_texts: Arc<Mutex<Option<(TaskId, usize)>>>,
}

impl CheckpointStore {
    /// Create a store over the given backends.
    pub fn new(
        small: Arc<dyn SmallValueStore>,
        large: Arc<dyn LargeValueStore>,
        inline_threshold: u64,
    ) -> Self {
        Self {
            small,
            large,
            inline_threshold,
            written_texts: Arc::new(Mutex::new(None)),
        }
    }

    /// Serialized texts above this size go to the large store.
    pub fn inline_threshold(&self) -> u64 {
        self.inline_threshold
    }

    /// Persist `meta` together with `texts`.
    pub async fn save(
        &self,
        mut meta: CheckpointMeta,
        texts: &[String],
    ) -> Result<TextsLocation, CheckpointError> {
        meta.texts_count = texts.len();
        meta.timestamp = chrono::Utc::now().to_rfc3339();

        if self.texts_already_large(&meta.task_id, texts.len()) {
            return self.write_slim(meta, None).await;
        }

        let serialized =
            serde_json::to_string(texts).map_err(|e| write_failed(StoreError::from(e)))?;
        if serialized.len() as u64 > self.inline_threshold {
            debug!(
                bytes = serialized.len(),
                threshold = self.inline_threshold,
                "texts exceed inline threshold"
            );
            return self.write_slim(meta, Some(serialized)).await;
        }

        meta.texts_stored_in_large = false;
        meta.texts = Some(texts.to_vec());
        let inline = serde_json::to_string(&meta).map_err(|e| write_failed(StoreError::from(e)))?;
        match self.small.set(META_KEY, &inline) {
            Ok(()) => {
                self.drop_legacy();
                metrics::counter!("checkpoint_writes_total", "location" => "inline").increment(1);
                Ok(TextsLocation::Inline)
            }
            Err(e) if e.is_quota() => {
                warn!(error = %e, "inline checkpoint over quota, moving texts to large store");
                meta.texts = None;
                self.write_slim(meta, Some(serialized)).await
            }
            Err(e) => Err(write_failed(e)),
        }
    }

    /// Write texts to the large store (unless `serialized` is `None`) and
    /// slim metadata to the small store.
    async fn write_slim(
        &self,
        mut meta: CheckpointMeta,
        serialized: Option<String>,
    ) -> Result<TextsLocation, CheckpointError> {
        if let Some(serialized) = serialized {
            self.large.put(TEXTS_KEY, serialized).await.map_err(write_failed)?;
            *self.written_texts.lock() = Some((meta.task_id.clone(), meta.texts_count));
        }

        meta.texts = None;
        meta.texts_stored_in_large = true;
        let slim = serde_json::to_string(&meta).map_err(|e| write_failed(StoreError::from(e)))?;
        self.small.set(META_KEY, &slim).map_err(write_failed)?;
        self.drop_legacy();
        metrics::counter!("checkpoint_writes_total", "location" => "large").increment(1);
        Ok(TextsLocation::Large)
    }

    fn texts_already_large(&self, task_id: &TaskId, count: usize) -> bool {
        self.written_texts
            .lock()
            .as_ref()
            .is_some_and(|(id, n)| id == task_id && *n == count)
    }

    fn drop_legacy(&self) {
        if let Err(e) = self.small.remove(LEGACY_KEY) {
            debug!(error = %e, "failed to remove legacy checkpoint key");
        }
    }

    /// Metadata only, without fetching large texts. Accepts the legacy shape.
    pub fn peek(&self) -> Result<Option<CheckpointMeta>, CheckpointError> {
        Ok(self.read_meta()?.map(|(mut meta, _)| {
            meta.texts = None;
            meta
        }))
    }

    fn read_meta(&self) -> Result<Option<(CheckpointMeta, bool)>, CheckpointError> {
        let (raw, legacy) = match self.small.get(META_KEY).map_err(CheckpointError::Read)? {
            Some(raw) => (raw, false),
            None => match self.small.get(LEGACY_KEY).map_err(CheckpointError::Read)? {
                Some(raw) => (raw, true),
                None => return Ok(None),
            },
        };
        let mut meta: CheckpointMeta = serde_json::from_str(&raw)
            .map_err(|e| CheckpointError::Corrupt(format!("unreadable metadata: {e}")))?;
        if legacy && !meta.texts_stored_in_large {
            meta.texts_count = meta.texts.as_ref().map_or(0, Vec::len);
        }
        Ok(Some((meta, legacy)))
    }

    /// Load and validate the latest checkpoint.
    pub async fn load(&self) -> Result<Option<LoadedCheckpoint>, CheckpointError> {
        let Some((mut meta, legacy)) = self.read_meta()? else {
            return Ok(None);
        };

        let texts = if meta.texts_stored_in_large {
            let raw = self
                .large
                .get(TEXTS_KEY)
                .await
                .map_err(CheckpointError::Read)?
                .ok_or_else(|| CheckpointError::Corrupt("texts missing from large store".into()))?;
            serde_json::from_str::<Vec<String>>(&raw)
                .map_err(|e| CheckpointError::Corrupt(format!("unreadable texts: {e}")))?
        } else {
            meta.texts
                .take()
                .ok_or_else(|| CheckpointError::Corrupt("texts missing from metadata".into()))?
        };

        meta.validate(&texts)?;
        if meta.texts_stored_in_large {
            *self.written_texts.lock() = Some((meta.task_id.clone(), texts.len()));
        }
        info!(
            task_id = %meta.task_id,
            processed = meta.processed_count,
            total = meta.total_count,
            legacy,
            "checkpoint loaded"
        );
        Ok(Some(LoadedCheckpoint { meta, texts }))
    }

    /// Delete metadata, then the legacy key, then the texts payload.
    pub async fn clear(&self) -> Result<(), CheckpointError> {
        self.small.remove(META_KEY).map_err(write_failed)?;
        self.small.remove(LEGACY_KEY).map_err(write_failed)?;
        self.large.delete(TEXTS_KEY).await.map_err(write_failed)?;
        *self.written_texts.lock() = None;
        debug!("checkpoint cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::storage::{MemoryLargeStore, MemorySmallStore};

    fn stores(quota: u64, threshold: u64) -> (Arc<MemorySmallStore>, Arc<MemoryLargeStore>, CheckpointStore) {
        let small = Arc::new(MemorySmallStore::new(quota));
        let large = Arc::new(MemoryLargeStore::new());
        let cp = CheckpointStore::new(small.clone(), large.clone(), threshold);
        (small, large, cp)
    }

    fn corpus(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text number {i}")).collect()
    }

    fn meta_for(task: &TaskId, total: usize, done: usize) -> CheckpointMeta {
        CheckpointMeta::new(task.clone(), total, done, (0..done).collect())
    }

    #[tokio::test]
    async fn small_texts_are_inlined() {
        let (small, large, cp) = stores(1 << 20, 1 << 20);
        let task = TaskId::new();
        let texts = corpus(10);
        let loc = cp.save(meta_for(&task, 10, 4), &texts).await.unwrap();
        assert_eq!(loc, TextsLocation::Inline);
        assert!(large.get(TEXTS_KEY).await.unwrap().is_none());

        let raw: serde_json::Value =
            serde_json::from_str(&small.get(META_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw["textsStoredInLarge"], false);
        assert_eq!(raw["texts"].as_array().unwrap().len(), 10);

        let loaded = cp.load().await.unwrap().unwrap();
        assert_eq!(loaded.texts, texts);
        assert_eq!(loaded.meta.processed_count, 4);
        assert!(loaded.meta.texts.is_none());
    }

    #[tokio::test]
    async fn large_texts_split_out() {
        let (small, large, cp) = stores(1 << 20, 64);
        let task = TaskId::new();
        let texts = corpus(20);
        let loc = cp.save(meta_for(&task, 20, 5), &texts).await.unwrap();
        assert_eq!(loc, TextsLocation::Large);

        let raw: serde_json::Value =
            serde_json::from_str(&small.get(META_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw["textsStoredInLarge"], true);
        assert_eq!(raw["textsCount"], 20);
        assert!(raw.get("texts").is_none());
        assert!(large.get(TEXTS_KEY).await.unwrap().is_some());

        let loaded = cp.load().await.unwrap().unwrap();
        assert_eq!(loaded.texts, texts);
    }

    #[tokio::test]
    async fn unchanged_texts_written_once() {
        let (_, large, cp) = stores(1 << 20, 64);
        let task = TaskId::new();
        let texts = corpus(20);
        for done in [2, 4, 6] {
            let _ = cp.save(meta_for(&task, 20, done), &texts).await.unwrap();
        }
        assert_eq!(large.put_count(), 1);
        assert_eq!(cp.peek().unwrap().unwrap().processed_count, 6);
    }

    #[tokio::test]
    async fn inline_quota_error_escalates_texts() {
        let texts = corpus(40);
        let inline_len = serde_json::to_string(&texts).unwrap().len() as u64;
        let (small, large, cp) = stores(inline_len, 1 << 20);

        let loc = cp.save(meta_for(&TaskId::new(), 40, 8), &texts).await.unwrap();
        assert_eq!(loc, TextsLocation::Large);
        assert!(small.used_bytes() <= small.quota_bytes());
        assert!(large.get(TEXTS_KEY).await.unwrap().is_some());
        assert!(cp.peek().unwrap().unwrap().texts_stored_in_large);
    }

    #[tokio::test]
    async fn quota_error_on_slim_meta_is_write_failed() {
        let (_, _, cp) = stores(16, 8);
        let err = cp
            .save(meta_for(&TaskId::new(), 20, 2), &corpus(20))
            .await
            .unwrap_err();
        assert_matches!(err, CheckpointError::WriteFailed { ref source } if source.is_quota());
        assert_eq!(err.code(), "CHECKPOINT_WRITE_FAILED");
        assert_eq!(err.class(), ErrorClass::Quota);
    }

    #[tokio::test]
    async fn legacy_shape_is_read_and_replaced() {
        let (small, _, cp) = stores(1 << 20, 1 << 20);
        let task = TaskId::new();
        let legacy = serde_json::json!({
            "processedCount": 2,
            "totalCount": 3,
            "nextIndex": 2,
            "processedIndices": [0, 1],
            "taskId": task.as_str(),
            "texts": ["a", "b", "c"],
        });
        small.set(LEGACY_KEY, &legacy.to_string()).unwrap();

        let loaded = cp.load().await.unwrap().unwrap();
        assert_eq!(loaded.meta.texts_count, 3);
        assert_eq!(loaded.texts, vec!["a", "b", "c"]);

        let _ = cp.save(loaded.meta, &loaded.texts).await.unwrap();
        assert!(small.get(LEGACY_KEY).unwrap().is_none());
        assert!(small.get(META_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupt_counts_rejected_and_left_in_place() {
        let (small, _, cp) = stores(1 << 20, 1 << 20);
        let mut meta = meta_for(&TaskId::new(), 3, 2);
        meta.texts_count = 5;
        meta.texts = Some(vec!["a".into(), "b".into(), "c".into()]);
        let raw = serde_json::to_string(&meta).unwrap();
        small.set(META_KEY, &raw).unwrap();

        let err = cp.load().await.unwrap_err();
        assert_matches!(err, CheckpointError::Corrupt(ref msg) if msg.contains("textsCount"));
        assert_eq!(small.get(META_KEY).unwrap().unwrap(), raw);
    }

    #[tokio::test]
    async fn processed_beyond_total_rejected() {
        let (small, _, cp) = stores(1 << 20, 1 << 20);
        let mut meta = CheckpointMeta::new(TaskId::new(), 2, 2, vec![0, 1, 2]);
        meta.texts = Some(vec!["a".into(), "b".into()]);
        meta.texts_count = 2;
        small.set(META_KEY, &serde_json::to_string(&meta).unwrap()).unwrap();
        let err = cp.load().await.unwrap_err();
        assert_matches!(err, CheckpointError::Corrupt(ref msg) if msg.contains("exceeds"));
    }

    async fn load_with_indices(total: usize, next: usize, indices: Vec<usize>) -> CheckpointError {
        let (small, _, cp) = stores(1 << 20, 1 << 20);
        let mut meta = CheckpointMeta::new(TaskId::new(), total, next, indices);
        meta.texts = Some(corpus(total));
        small.set(META_KEY, &serde_json::to_string(&meta).unwrap()).unwrap();
        let err = cp.load().await.unwrap_err();
        assert_eq!(err.code(), "CHECKPOINT_CORRUPT");
        err
    }

    #[tokio::test]
    async fn gap_below_next_index_rejected() {
        let err = load_with_indices(4, 3, vec![0, 2]).await;
        assert_matches!(err, CheckpointError::Corrupt(ref msg) if msg.contains("index 1 below nextIndex 3"));
    }

    #[tokio::test]
    async fn duplicate_index_rejected() {
        let err = load_with_indices(4, 2, vec![0, 0]).await;
        assert_matches!(err, CheckpointError::Corrupt(ref msg) if msg.contains("recorded twice"));
    }

    #[tokio::test]
    async fn out_of_range_index_rejected() {
        let err = load_with_indices(4, 1, vec![99]).await;
        assert_matches!(err, CheckpointError::Corrupt(ref msg) if msg.contains("outside corpus"));
    }

    #[tokio::test]
    async fn indices_past_next_index_are_allowed() {
        let (small, _, cp) = stores(1 << 20, 1 << 20);
        let mut meta = CheckpointMeta::new(TaskId::new(), 4, 2, vec![0, 1, 3]);
        meta.texts = Some(corpus(4));
        small.set(META_KEY, &serde_json::to_string(&meta).unwrap()).unwrap();
        assert!(cp.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_large_texts_is_corrupt() {
        let (small, _, cp) = stores(1 << 20, 1 << 20);
        let mut meta = meta_for(&TaskId::new(), 3, 1);
        meta.texts_stored_in_large = true;
        small.set(META_KEY, &serde_json::to_string(&meta).unwrap()).unwrap();
        assert_matches!(cp.load().await, Err(CheckpointError::Corrupt(_)));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let (small, large, cp) = stores(1 << 20, 8);
        let _ = cp.save(meta_for(&TaskId::new(), 5, 1), &corpus(5)).await.unwrap();
        cp.clear().await.unwrap();
        assert!(small.keys().is_empty());
        assert!(large.get(TEXTS_KEY).await.unwrap().is_none());
        assert!(cp.load().await.unwrap().is_none());
    }
}

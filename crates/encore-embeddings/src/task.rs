//! Resumable, checkpointed embedding tasks.
//!
//! [`EmbeddingTaskManager`] drives an [`EmbeddingService`] over a corpus in
//! batches, upserts the vectors into the shared [`VectorStore`], and writes a
//! split checkpoint at batch boundaries so an interrupted run resumes from
//! the last completed batch.
//!
//! One task runs at a time per manager. Cancellation is cooperative: the
//! in-flight batch finishes (or is abandoned if a backoff sleep is
//! interrupted), progress is flushed to the checkpoint, and the run returns
//! [`EmbeddingError::Cancelled`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use encore_core::{ClassifiedError, ErrorClass, TaskId};
use encore_resilience::{BudgetDefaults, BudgetManager, RetryConfig, RetryEvent, with_retry};
use encore_settings::EncoreSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointMeta, CheckpointStore, LoadedCheckpoint};
use crate::errors::{EmbeddingError, Result};
use crate::progress::{ProgressSink, ProgressStage, ProgressTracker};
use crate::service::EmbeddingService;
use crate::vector_store::VectorStore;

// ─────────────────────────────────────────────────────────────────────────────
// Options and reports
// ─────────────────────────────────────────────────────────────────────────────

/// Per-task options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TaskOptions {
    /// Items per batch (default: 32).
    pub batch_size: usize,
    /// Checkpoint every N batches (default: 1).
    pub checkpoint_interval: usize,
    /// Vector record ids are `{id_prefix}-{index}` (default: `chunk`).
    pub id_prefix: String,
    /// Retry policy for embedding calls.
    pub retry: RetryConfig,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::from_settings(&EncoreSettings::default())
    }
}

impl TaskOptions {
    /// Build from the `embedding` and `retry` settings sections.
    pub fn from_settings(settings: &EncoreSettings) -> Self {
        Self {
            batch_size: settings.embedding.batch_size,
            checkpoint_interval: settings.embedding.checkpoint_interval,
            id_prefix: settings.embedding.id_prefix.clone(),
            retry: RetryConfig::from_settings(&settings.retry),
        }
    }

    fn record_id(&self, index: usize) -> String {
        format!("{}-{index}", self.id_prefix)
    }
}

/// Snapshot returned by [`EmbeddingTaskManager::status`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Whether a task is active.
    pub is_running: bool,
    /// Items completed by the current or last task.
    pub processed: usize,
    /// Corpus size of the current or last task.
    pub total: usize,
    /// Most recent failure, including checkpoint write failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ClassifiedError>,
    /// Current or last task id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Summary of a completed task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    /// Task id.
    pub task_id: TaskId,
    /// Corpus size.
    pub total: usize,
    /// Items processed, including those from before a resume.
    pub processed: usize,
    /// Vectors upserted by this run.
    pub embedded: usize,
    /// Empty items skipped by this run.
    pub skipped: usize,
    /// Batches run by this run.
    pub batches: usize,
    /// Checkpoint writes that failed.
    pub checkpoint_failures: usize,
}

#[derive(Debug, Default)]
struct TaskState {
    task_id: Option<TaskId>,
    processed: usize,
    total: usize,
    last_error: Option<ClassifiedError>,
}

/// In-memory progress of one run.
struct Run {
    task_id: TaskId,
    texts: Vec<String>,
    processed_indices: Vec<usize>,
    done: HashSet<usize>,
    next_index: usize,
}

impl Run {
    fn fresh(texts: Vec<String>) -> Self {
        Self {
            task_id: TaskId::new(),
            texts,
            processed_indices: Vec::new(),
            done: HashSet::new(),
            next_index: 0,
        }
    }

    fn from_checkpoint(loaded: LoadedCheckpoint) -> Self {
        let done = loaded.meta.processed_indices.iter().copied().collect();
        Self {
            task_id: loaded.meta.task_id,
            texts: loaded.texts,
            processed_indices: loaded.meta.processed_indices,
            done,
            next_index: loaded.meta.next_index,
        }
    }

    fn meta(&self) -> CheckpointMeta {
        CheckpointMeta::new(
            self.task_id.clone(),
            self.texts.len(),
            self.next_index,
            self.processed_indices.clone(),
        )
    }
}

/// Clears the running flag on every exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Runs embedding tasks against a shared vector store.
pub struct EmbeddingTaskManager {
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<Mutex<VectorStore>>,
    checkpoints: CheckpointStore,
    budgets: BudgetManager,
    init_budget_ms: u64,
    running: AtomicBool,
    state: Mutex<TaskState>,
    cancel: Mutex<CancellationToken>,
}

impl EmbeddingTaskManager {
    /// Create a manager. The manager is the only writer to `store` and to
    /// the checkpoint backends.
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<Mutex<VectorStore>>,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            embedder,
            store,
            checkpoints,
            budgets: BudgetManager::new(),
            init_budget_ms: BudgetDefaults::default().embedding_init_ms,
            running: AtomicBool::new(false),
            state: Mutex::new(TaskState::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Share a budget manager and set the initialization budget.
    #[must_use]
    pub fn with_budgets(mut self, budgets: BudgetManager, defaults: &BudgetDefaults) -> Self {
        self.budgets = budgets;
        self.init_budget_ms = defaults.embedding_init_ms;
        self
    }

    /// The shared vector store.
    pub fn store(&self) -> &Arc<Mutex<VectorStore>> {
        &self.store
    }

    /// Embed `corpus` from the beginning.
    pub async fn start(
        &self,
        corpus: Vec<String>,
        options: &TaskOptions,
        progress: &dyn ProgressSink,
    ) -> Result<TaskReport> {
        let (_running, token) = self.claim()?;
        self.ensure_ready(progress).await?;
        self.drive(Run::fresh(corpus), options, progress, &token).await
    }

    /// Continue from the persisted checkpoint.
    pub async fn resume(
        &self,
        options: &TaskOptions,
        progress: &dyn ProgressSink,
    ) -> Result<TaskReport> {
        let (_running, token) = self.claim()?;
        let loaded = match self.checkpoints.load().await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return Err(EmbeddingError::NoCheckpoint),
            Err(e) => {
                warn!(code = e.code(), error = %e, "checkpoint unusable, left in place");
                return Err(e.into());
            }
        };
        self.ensure_ready(progress).await?;
        self.drive(Run::from_checkpoint(loaded), options, progress, &token).await
    }

    /// Stop after the in-flight batch. No-op when idle.
    pub fn cancel(&self) {
        let token = self.cancel.lock();
        if self.running.load(Ordering::SeqCst) {
            info!("embedding task cancellation requested");
        }
        token.cancel();
    }

    /// Current task status.
    pub fn status(&self) -> TaskStatus {
        let state = self.state.lock();
        TaskStatus {
            is_running: self.running.load(Ordering::SeqCst),
            processed: state.processed,
            total: state.total,
            last_error: state.last_error.clone(),
            task_id: state.task_id.clone(),
        }
    }

    /// Persisted checkpoint metadata, if any.
    pub fn checkpoint(&self) -> Result<Option<CheckpointMeta>> {
        Ok(self.checkpoints.peek()?)
    }

    /// Delete the persisted checkpoint. Fails while a task is running.
    pub async fn discard_checkpoint(&self) -> Result<()> {
        let (_running, _) = self.claim()?;
        self.checkpoints.clear().await?;
        info!("checkpoint discarded");
        Ok(())
    }

    /// Initialize the embedding service under the initialization budget.
    pub async fn ensure_ready(&self, progress: &dyn ProgressSink) -> Result<()> {
        if self.embedder.is_ready() {
            return Ok(());
        }
        let mut tracker = ProgressTracker::new(ProgressStage::Initializing, None);
        progress.on_progress(&tracker.update(0, 1));

        let init = self
            .budgets
            .with_budget("embedding_init", self.init_budget_ms, self.embedder.initialize())
            .await;
        if let Err(e) = init {
            warn!(code = %e.code, error = %e, "embedding service initialization failed");
            self.state.lock().last_error = Some(e.clone());
            return Err(EmbeddingError::Provider(e));
        }
        if !self.embedder.is_ready() {
            return Err(EmbeddingError::NotReady);
        }
        progress.on_progress(&tracker.update(1, 1));
        Ok(())
    }

    /// Mark the manager running and install the run's cancellation token.
    /// Both happen under the token lock so a concurrent `cancel()` lands on
    /// either the idle token or the new one.
    fn claim(&self) -> Result<(RunningGuard<'_>, CancellationToken)> {
        let mut slot = self.cancel.lock();
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EmbeddingError::AlreadyRunning)?;
        let token = CancellationToken::new();
        *slot = token.clone();
        Ok((RunningGuard(&self.running), token))
    }

    async fn drive(
        &self,
        mut run: Run,
        options: &TaskOptions,
        progress: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> Result<TaskReport> {
        let total = run.texts.len();
        let batch_size = options.batch_size.max(1);
        let interval = options.checkpoint_interval.max(1);
        *self.state.lock() = TaskState {
            task_id: Some(run.task_id.clone()),
            processed: run.processed_indices.len(),
            total,
            last_error: None,
        };
        info!(
            task_id = %run.task_id,
            total,
            resume_at = run.next_index,
            batch_size,
            "embedding task started"
        );

        let mut tracker = ProgressTracker::new(ProgressStage::Embedding, Some(run.task_id.clone()));
        let mut report = TaskReport {
            task_id: run.task_id.clone(),
            total,
            processed: run.processed_indices.len(),
            embedded: 0,
            skipped: 0,
            batches: 0,
            checkpoint_failures: 0,
        };
        let mut since_checkpoint = 0;

        while run.next_index < total {
            if token.is_cancelled() {
                return self.stop_cancelled(&run, &mut report).await;
            }

            let end = (run.next_index + batch_size).min(total);
            let batch: Vec<usize> = (run.next_index..end)
                .filter(|i| !run.done.contains(i))
                .collect();

            let vectors = match self.embed_batch(&run.texts, &batch, options, token).await {
                Ok(vectors) => vectors,
                Err(_) if token.is_cancelled() => {
                    return self.stop_cancelled(&run, &mut report).await;
                }
                Err(e) => {
                    error!(
                        task_id = %run.task_id,
                        code = %e.code,
                        error = %e,
                        "embedding batch failed, aborting task"
                    );
                    let _ = self.write_checkpoint(&run).await;
                    // the batch failure outranks a checkpoint write failure
                    self.state.lock().last_error = Some(e.clone());
                    return Err(EmbeddingError::Provider(e));
                }
            };

            {
                let mut store = self.store.lock();
                for (&index, vector) in batch.iter().zip(vectors) {
                    match vector {
                        Some(vector) => {
                            let payload = serde_json::json!({
                                "index": index,
                                "taskId": run.task_id.as_str(),
                                "text": run.texts[index],
                            });
                            store.upsert(options.record_id(index), vector, payload);
                            report.embedded += 1;
                        }
                        None => report.skipped += 1,
                    }
                }
            }

            run.processed_indices.extend_from_slice(&batch);
            run.done.extend(batch.iter().copied());
            run.next_index = end;
            report.batches += 1;
            report.processed = run.processed_indices.len();
            self.state.lock().processed = report.processed;
            metrics::counter!("embedding_batches_total").increment(1);
            debug!(task_id = %run.task_id, processed = report.processed, total, "batch complete");

            since_checkpoint += 1;
            if since_checkpoint >= interval || end == total {
                since_checkpoint = 0;
                if !self.write_checkpoint(&run).await {
                    report.checkpoint_failures += 1;
                }
            }

            progress.on_progress(&tracker.update(report.processed, total));
        }

        if total == 0 {
            progress.on_progress(&tracker.update(0, 0));
        }

        if let Err(e) = self.checkpoints.clear().await {
            warn!(code = e.code(), error = %e, "failed to clear checkpoint after completion");
            self.state.lock().last_error = Some(ClassifiedError::new(e.class(), e.code(), e.to_string()));
        }
        info!(
            task_id = %run.task_id,
            embedded = report.embedded,
            skipped = report.skipped,
            batches = report.batches,
            "embedding task completed"
        );
        Ok(report)
    }

    /// Embed the non-empty items of `batch`; empty items yield `None`.
    async fn embed_batch(
        &self,
        texts: &[String],
        batch: &[usize],
        options: &TaskOptions,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<Option<Vec<f32>>>, ClassifiedError> {
        let positions: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, i)| !texts[**i].trim().is_empty())
            .map(|(pos, _)| pos)
            .collect();
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
        if positions.is_empty() {
            return Ok(slots);
        }

        let items: Vec<String> = positions.iter().map(|p| texts[batch[*p]].clone()).collect();
        let embedder = self.embedder.as_ref();
        let observer = |event: &RetryEvent<'_>| {
            warn!(
                attempt = event.attempt,
                delay_ms = event.delay_ms,
                code = %event.error.code,
                "retrying embedding batch"
            );
        };

        let items = items.as_slice();
        let outcome = with_retry(
            "embedding_batch",
            &options.retry,
            Some(token),
            Some(&observer),
            move |_| async move { embed_items(embedder, items).await },
        )
        .await;
        let vectors = outcome.into_result()?;

        for (pos, vector) in positions.into_iter().zip(vectors) {
            slots[pos] = Some(vector);
        }
        Ok(slots)
    }

    /// Persist the run; failures are recorded, never fatal.
    async fn write_checkpoint(&self, run: &Run) -> bool {
        match self.checkpoints.save(run.meta(), &run.texts).await {
            Ok(location) => {
                debug!(task_id = %run.task_id, ?location, "checkpoint written");
                true
            }
            Err(e) => {
                error!(
                    task_id = %run.task_id,
                    code = e.code(),
                    error = %e,
                    "checkpoint write failed, continuing without resume safety"
                );
                self.state.lock().last_error =
                    Some(ClassifiedError::new(e.class(), e.code(), e.to_string()));
                false
            }
        }
    }

    async fn stop_cancelled(&self, run: &Run, report: &mut TaskReport) -> Result<TaskReport> {
        if !self.write_checkpoint(run).await {
            report.checkpoint_failures += 1;
        }
        info!(
            task_id = %run.task_id,
            processed = run.processed_indices.len(),
            "embedding task cancelled, checkpoint preserved"
        );
        Err(EmbeddingError::Cancelled)
    }
}

/// One batched call, or one call per item when batching is unsupported.
async fn embed_items(
    embedder: &dyn EmbeddingService,
    items: &[String],
) -> std::result::Result<Vec<Vec<f32>>, ClassifiedError> {
    if embedder.supports_batch() {
        let vectors = embedder.embed(items).await?;
        if vectors.len() != items.len() {
            return Err(ClassifiedError::of(
                ErrorClass::InvalidState,
                format!(
                    "embedding service returned {} vectors for {} inputs",
                    vectors.len(),
                    items.len()
                ),
            ));
        }
        return Ok(vectors);
    }

    let mut vectors = Vec::with_capacity(items.len());
    for item in items {
        vectors.push(embedder.embed_single(item).await?);
    }
    Ok(vectors)
}

//! Embedding progress reporting.

use encore_core::TaskId;
use serde::Serialize;

/// Percent milestones announced as they are crossed. 55 marks the middle
/// of the run.
pub const MILESTONES: [u8; 6] = [5, 15, 20, 55, 95, 100];

/// Phase a progress event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    /// Embedding model loading.
    Initializing,
    /// Corpus batches running.
    Embedding,
}

/// One progress notification.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Phase of the run.
    pub stage: ProgressStage,
    /// Task being reported, absent during initialization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Items completed.
    pub processed: usize,
    /// Items in the corpus.
    pub total: usize,
    /// Completion in `[0, 1]`; never decreases within a stage.
    pub fraction: f64,
    /// `fraction` as a whole percent.
    pub percent: u8,
    /// Milestones newly crossed by this event, ascending. One batch can
    /// cross several.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub milestones: Vec<u8>,
}

/// Receives progress events.
pub trait ProgressSink: Send + Sync {
    /// Called after every batch and around initialization.
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// No-op progress sink.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    #[allow(clippy::unused_self)]
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Turns raw counts into monotonic events with milestones.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    stage: ProgressStage,
    task_id: Option<TaskId>,
    fraction: f64,
    last_percent: u8,
}

impl ProgressTracker {
    pub(crate) fn new(stage: ProgressStage, task_id: Option<TaskId>) -> Self {
        Self {
            stage,
            task_id,
            fraction: 0.0,
            last_percent: 0,
        }
    }

    pub(crate) fn update(&mut self, processed: usize, total: usize) -> ProgressEvent {
        let raw = if total == 0 {
            1.0
        } else {
            (processed as f64 / total as f64).clamp(0.0, 1.0)
        };
        self.fraction = self.fraction.max(raw);
        let percent = (self.fraction * 100.0 + 1e-9).floor().min(100.0) as u8;
        let milestones = MILESTONES
            .into_iter()
            .filter(|m| *m > self.last_percent && *m <= percent)
            .collect();
        self.last_percent = self.last_percent.max(percent);

        ProgressEvent {
            stage: self.stage,
            task_id: self.task_id.clone(),
            processed,
            total,
            fraction: self.fraction,
            percent,
            milestones,
        }
    }
}

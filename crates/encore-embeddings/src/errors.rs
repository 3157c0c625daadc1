//! Embedding error types.
//!
//! Every variant maps onto the shared taxonomy via [`EmbeddingError::class`]
//! and carries a stable [`EmbeddingError::code`].

use encore_core::{ClassifiedError, ErrorClass};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::storage::StoreError;

/// Errors from embedding task operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Another task is active on this manager.
    #[error("an embedding task is already running")]
    AlreadyRunning,

    /// `resume` found nothing to resume.
    #[error("no checkpoint to resume from")]
    NoCheckpoint,

    /// Checkpoint read, write, or validation failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Value store failure outside checkpointing.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The embedding function failed (already classified).
    #[error("embedding failed: {0}")]
    Provider(ClassifiedError),

    /// The task was cancelled; the checkpoint is preserved.
    #[error("embedding task cancelled")]
    Cancelled,

    /// The embedding service did not become ready.
    #[error("embedding service not ready")]
    NotReady,
}

impl EmbeddingError {
    /// Stable error code.
    pub fn code(&self) -> String {
        match self {
            Self::AlreadyRunning => "ALREADY_RUNNING".into(),
            Self::NoCheckpoint => "NO_CHECKPOINT".into(),
            Self::Checkpoint(e) => e.code().into(),
            Self::Store(e) => e.code().into(),
            Self::Provider(e) => e.code.clone(),
            Self::Cancelled => "ABORTED".into(),
            Self::NotReady => "NOT_READY".into(),
        }
    }

    /// Taxonomy class.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyRunning | Self::NoCheckpoint | Self::NotReady => ErrorClass::InvalidState,
            Self::Checkpoint(e) => e.class(),
            Self::Store(e) => e.class(),
            Self::Provider(e) => e.class,
            Self::Cancelled => ErrorClass::Aborted,
        }
    }
}

impl From<EmbeddingError> for ClassifiedError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Provider(inner) => inner,
            other => ClassifiedError::new(other.class(), other.code(), other.to_string()),
        }
    }
}

/// Result alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

//! # encore-embeddings
//!
//! Checkpointed embedding tasks and in-memory vector search.
//!
//! - [`EmbeddingService`]: the embedding seam, with a deterministic
//!   [`HashEmbeddingService`] for tests and the CLI
//! - [`VectorStore`]: id → (vector, payload) with cosine top-K search
//! - [`EmbeddingTaskManager`]: batched, resumable embedding runs
//! - [`CheckpointStore`]: split checkpoint over a quota-bound small store and
//!   a large store
//! - [`normalize`]: L2 and cosine helpers

#![deny(unsafe_code)]

pub mod checkpoint;
pub mod errors;
pub mod normalize;
pub mod progress;
pub mod service;
pub mod storage;
pub mod task;
pub mod vector_store;

pub use checkpoint::{CheckpointError, CheckpointMeta, CheckpointStore, LoadedCheckpoint, TextsLocation};
pub use errors::EmbeddingError;
pub use progress::{NoProgress, ProgressEvent, ProgressSink, ProgressStage};
pub use service::{EmbeddingService, HashEmbeddingService};
pub use storage::{
    LargeValueStore, MemoryLargeStore, MemorySmallStore, SmallValueStore, SqliteLargeStore,
    SqliteSmallStore, StoreError,
};
pub use task::{EmbeddingTaskManager, TaskOptions, TaskReport, TaskStatus};
pub use vector_store::{SearchHit, SearchParams, VectorRecord, VectorStore};

//! Embedding service trait and a deterministic hash-based implementation.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use encore_core::{ClassifiedError, ErrorClass};
use sha2::{Digest, Sha256};

use crate::normalize::l2_normalize;

/// Trait for embedding text into vectors.
///
/// Implementations return L2-normalized vectors and report failures as
/// classified errors so the task manager can decide whether to retry.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a batch of texts; one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClassifiedError>;

    /// Embed a single text (default: calls `embed` with one item).
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>, ClassifiedError> {
        let results = self.embed(&[text.to_string()]).await?;
        results.into_iter().next().ok_or_else(|| {
            ClassifiedError::of(ErrorClass::Unknown, "embedding service returned no vector")
        })
    }

    /// Load the model. Called once under the initialization budget.
    async fn initialize(&self) -> Result<(), ClassifiedError> {
        Ok(())
    }

    /// Whether the service is ready for inference.
    fn is_ready(&self) -> bool;

    /// Whether `embed` accepts a whole batch in one call.
    fn supports_batch(&self) -> bool {
        true
    }

    /// Output embedding dimensions.
    fn dimensions(&self) -> usize;
}

/// Deterministic embedding service.
///
/// Hashes input text with SHA-256 and spreads the digest over the vector
/// components. Equal texts embed identically; used for tests and the CLI.
pub struct HashEmbeddingService {
    dims: usize,
    ready: AtomicBool,
}

impl HashEmbeddingService {
    /// Create a ready service with the given dimensions.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            ready: AtomicBool::new(true),
        }
    }

    /// Set whether this service is ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Embed without going through the async trait.
    pub fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let mut v: Vec<f32> = Vec::with_capacity(self.dims);
        let mut block = 0u32;
        while v.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(block.to_le_bytes());
            hasher.update(text.as_bytes());
            let hash = hasher.finalize();
            v.extend(
                hash.iter()
                    .take(self.dims - v.len())
                    .map(|b| (f32::from(*b) / 127.5) - 1.0),
            );
            block += 1;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingService for HashEmbeddingService {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ClassifiedError> {
        if !self.is_ready() {
            return Err(ClassifiedError::of(
                ErrorClass::InvalidState,
                "embedding service not ready",
            ));
        }
        Ok(texts.iter().map(|t| self.hash_to_vector(t)).collect())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{cosine_similarity, l2_norm};

    #[tokio::test]
    async fn single_returns_correct_dims() {
        let svc = HashEmbeddingService::new(384);
        let result = svc.embed_single("test").await.unwrap();
        assert_eq!(result.len(), 384);
        assert!((l2_norm(&result) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn batch_correct_count() {
        let svc = HashEmbeddingService::new(64);
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results = svc.embed(&texts).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.len() == 64));
    }

    #[tokio::test]
    async fn deterministic_and_distinct() {
        let svc = HashEmbeddingService::new(128);
        let a1 = svc.embed_single("jazz in 1998").await.unwrap();
        let a2 = svc.embed_single("jazz in 1998").await.unwrap();
        let b = svc.embed_single("punk in 2004").await.unwrap();
        assert_eq!(a1, a2);
        assert!(cosine_similarity(&a1, &b) < 0.99);
    }

    #[tokio::test]
    async fn not_ready_is_invalid_state() {
        let svc = HashEmbeddingService::new(8);
        svc.set_ready(false);
        let err = svc.embed_single("x").await.unwrap_err();
        assert_eq!(err.class, ErrorClass::InvalidState);
    }
}

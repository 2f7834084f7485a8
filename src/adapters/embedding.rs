//! Reference embedding adapter (§4.4): a deterministic hash-based
//! pseudo-embedding. Good enough to exercise the optional memory-lookup
//! path in tests; a real deployment swaps in a model-backed adapter.

use async_trait::async_trait;

use super::EmbeddingAdapter;
use crate::error::{AdapterError, AdapterKind};

const DIMS: usize = 32;

pub struct HashEmbeddingAdapter;

impl Default for HashEmbeddingAdapter {
    fn default() -> Self {
        Self
    }
}

#[async_trait]
impl EmbeddingAdapter for HashEmbeddingAdapter {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        if text.is_empty() {
            return Err(AdapterError::transient(AdapterKind::Embedding, "empty text"));
        }
        let mut vector = vec![0.0f32; DIMS];
        for (i, byte) in text.bytes().enumerate() {
            let slot = i % DIMS;
            vector[slot] += byte as f32;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
        for v in &mut vector {
            *v /= norm;
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_yields_same_vector() {
        let adapter = HashEmbeddingAdapter::default();
        let a = adapter.embed("hello world").await.unwrap();
        let b = adapter.embed("hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn different_text_yields_different_vector() {
        let adapter = HashEmbeddingAdapter::default();
        let a = adapter.embed("hello").await.unwrap();
        let b = adapter.embed("goodbye").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_text_is_non_fatal_but_rejected() {
        let adapter = HashEmbeddingAdapter::default();
        let err = adapter.embed("").await.unwrap_err();
        assert!(err.retryable);
    }
}

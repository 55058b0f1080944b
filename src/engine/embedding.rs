// ── Embedding function and vector math ─────────────────────────────────────

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::Embedder;

/// Deterministic character-hash embedding. No model, no network: each
/// character bumps one bucket chosen from its code point and position, and
/// the result is L2-normalized. Good enough for recall over short hook
/// payloads and for tests.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIMS: usize = 64;

    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> String {
        format!("hash-{}", self.dims)
    }

    fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        if self.dims == 0 {
            return Err(EngineError::EmbeddingUnavailable("zero-width embedder".into()));
        }
        let mut embedding = vec![0.0f32; self.dims];
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize).wrapping_add(i.wrapping_mul(7)) % self.dims;
            embedding[idx] += 1.0;
        }
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut embedding {
                *v /= norm;
            }
        }
        Ok(embedding)
    }
}

/// Cosine similarity between two vectors. Returns 0.0 if either is zero-length
/// or the widths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let e = HashEmbedder::default();
        let a = e.embed("fix the borrow checker error").unwrap();
        let b = e.embed("fix the borrow checker error").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn configurable_width() {
        assert_eq!(HashEmbedder::new(384).embed("x").unwrap().len(), 384);
        assert!(matches!(
            HashEmbedder::new(0).embed("x"),
            Err(EngineError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_width_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}

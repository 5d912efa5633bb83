//! Embedder contract and vector math
//!
//! The engine never computes embeddings itself; an external service does, and
//! this module defines the seam. It also owns the vector helpers shared by
//! the index, the retriever, and consolidation: cosine similarity and the
//! int8 quantization used as the cheap ranking form.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Default embedding dimensionality
pub const DEFAULT_DIMENSIONS: usize = 256;

/// The embedder could not produce a vector
#[derive(Debug, Clone, thiserror::Error)]
#[error("embedder error: {0}")]
pub struct EmbedderError(pub String);

/// External embedding service contract
///
/// Implementations must be deterministic per input for novelty detection to
/// behave; transient failures are reported through [`EmbedderError`] and
/// retried by callers.
pub trait Embedder: Send + Sync {
    /// Fixed output dimensionality
    fn dimensions(&self) -> usize;

    /// Produce a dense vector for the given text
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two f32 vectors
///
/// Returns 0.0 for mismatched lengths or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine similarity over the int8 quantized forms
pub fn cosine_similarity_i8(a: &[i8], b: &[i8]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0i64;
    let mut norm_a = 0i64;
    let mut norm_b = 0i64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as i64, *y as i64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0 || norm_b == 0 {
        return 0.0;
    }
    dot as f32 / ((norm_a as f32).sqrt() * (norm_b as f32).sqrt())
}

/// L2-normalize a vector in place; zero vectors are left untouched
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Quantize an f32 vector to int8 by max-abs scaling
///
/// Cosine similarity is scale-invariant, so the scale factor is not stored.
pub fn quantize_i8(v: &[f32]) -> Vec<i8> {
    let max_abs = v.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    if max_abs == 0.0 {
        return vec![0i8; v.len()];
    }
    v.iter()
        .map(|x| ((x / max_abs) * 127.0).round().clamp(-127.0, 127.0) as i8)
        .collect()
}

/// Expand an int8 vector back to f32 (unit scale)
pub fn dequantize_i8(q: &[i8]) -> Vec<f32> {
    q.iter().map(|x| *x as f32 / 127.0).collect()
}

// ============================================================================
// HASHED BAG-OF-TOKENS EMBEDDER
// ============================================================================

/// Deterministic embedder hashing tokens into a fixed-size bag
///
/// No model, no I/O: each token is hashed into one of `dims` buckets and the
/// result is L2-normalized, so texts sharing tokens land near each other.
/// Good enough for tests, benchmarks, and offline operation; production
/// deployments plug in a real embedding service instead.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    /// Create with the given dimensionality
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut v = vec![0.0f32; self.dims];
        for token in crate::search::tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dims;
            v[bucket] += 1.0;
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

// ============================================================================
// TESTS
// ============================================================================

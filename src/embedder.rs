//! Embedding provider abstraction and the local fastembed implementation.
//!
//! The [`EmbeddingProvider`] trait is the seam between the index engine /
//! query planner and the model runtime. The production implementation,
//! [`LocalEmbedder`], runs nomic-embed-text-v1.5 locally via fastembed
//! (768 dimensions, downloaded and cached on first use); tests substitute
//! deterministic stubs.
//!
//! Also provides the vector utilities shared with the store:
//! [`vec_to_blob`] / [`blob_to_vec`] for the little-endian f32 BLOB
//! encoding sqlite-vec consumes, [`cosine_similarity`], and
//! [`normalize`].

use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("failed to initialize embedding model: {0}")]
    Init(String),
    #[error("embedding inference failed: {0}")]
    Inference(String),
    #[error("embedding model not initialized")]
    NotReady,
}

/// Retrieval instruction prefixes for nomic-embed-text. Queries and
/// documents are embedded into the same space but with different task
/// prefixes.
const QUERY_PREFIX: &str = "search_query: ";
const DOCUMENT_PREFIX: &str = "search_document: ";

/// Marker appended when an input exceeds the character budget.
const TRUNCATION_MARKER: &str = "…[truncated]";

/// Maps strings to unit-norm dense vectors of a fixed dimension.
///
/// Methods are blocking; callers on the async runtime wrap them in
/// [`tokio::task::spawn_blocking`].
pub trait EmbeddingProvider: Send + Sync {
    fn dims(&self) -> usize;

    /// Embed a batch of chunk contents, one vector per input, aligned to
    /// input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Embed a single search query.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Local embedding via fastembed, lazily initialized.
///
/// The model handle lives behind a mutex because the underlying runtime
/// is not reentrant; concurrent callers serialize through it. The first
/// call pays the model load (and, once ever, the download).
pub struct LocalEmbedder {
    model: Mutex<Option<TextEmbedding>>,
    max_chars: usize,
}

impl LocalEmbedder {
    pub fn new(max_chars: usize) -> LocalEmbedder {
        LocalEmbedder {
            model: Mutex::new(None),
            max_chars,
        }
    }

    /// One-shot lazy init: load the model if it has not been loaded yet.
    fn ensure_initialized(
        &self,
        guard: &mut Option<TextEmbedding>,
    ) -> Result<(), EmbedError> {
        if guard.is_some() {
            return Ok(());
        }
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::NomicEmbedTextV15).with_show_download_progress(false),
        )
        .map_err(|e| EmbedError::Init(e.to_string()))?;
        *guard = Some(model);
        Ok(())
    }

    fn run(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut guard = self.model.lock().expect("embedder mutex poisoned");
        self.ensure_initialized(&mut guard)?;
        let model = guard.as_mut().ok_or(EmbedError::NotReady)?;

        let mut vectors = model
            .embed(inputs, None)
            .map_err(|e| EmbedError::Inference(e.to_string()))?;
        for vector in &mut vectors {
            normalize(vector);
        }
        Ok(vectors)
    }
}

impl EmbeddingProvider for LocalEmbedder {
    fn dims(&self) -> usize {
        crate::store::EMBEDDING_DIM
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| format!("{}{}", DOCUMENT_PREFIX, truncate_input(t, self.max_chars)))
            .collect();
        self.run(inputs)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let input = format!("{}{}", QUERY_PREFIX, truncate_input(text, self.max_chars));
        let vectors = self.run(vec![input])?;
        vectors.into_iter().next().ok_or(EmbedError::NotReady)
    }
}

/// Cut `text` at `max_chars` characters (not bytes) and append the
/// truncation marker. Short inputs pass through unchanged.
pub fn truncate_input(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}{}", cut, TRUNCATION_MARKER)
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
/// This is the layout sqlite-vec expects for float vectors.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty or
/// mismatched vectors.
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vector = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vector);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vector);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_truncate_short_input_unchanged() {
        assert_eq!(truncate_input("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long_input_marked() {
        let long = "a".repeat(50);
        let out = truncate_input(&long, 10);
        assert!(out.starts_with("aaaaaaaaaa"));
        assert!(out.ends_with("[truncated]"));
        assert_eq!(out.chars().filter(|c| *c == 'a').count(), 10);
    }
}

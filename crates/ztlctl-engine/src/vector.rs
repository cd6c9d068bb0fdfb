//! Optional semantic vectors for hybrid ranking.
//!
//! The engine only depends on the [`Embedder`] trait; real embedding
//! backends are external collaborators. The built-in reference
//! implementation is a deterministic hashed bag-of-words projection: good
//! enough to exercise hybrid ranking end to end, dependency-free, and
//! stable across runs so tests can assert on it.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;

use ztlctl_config::VectorsConfig;
use ztlctl_store::queries;

use crate::EngineError;

/// Turns text into a dense vector of a fixed dimension.
pub trait Embedder: Send + Sync {
    /// Stable backend name.
    fn name(&self) -> &str;

    /// Embed one text.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic hashed bag-of-words embedder.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    /// Create an embedder with the configured dimensionality.
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-bow"
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

/// Embedding maintenance tied into the write pipelines.
#[derive(Clone)]
pub struct VectorService {
    enabled: bool,
    embedder: Arc<dyn Embedder>,
}

impl VectorService {
    /// Build the service from configuration.
    pub fn new(config: &VectorsConfig) -> Self {
        Self {
            enabled: config.enabled,
            embedder: Arc::new(HashEmbedder::new(config.dim)),
        }
    }

    /// Swap in an external embedding backend.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Whether embeddings are computed and used for ranking.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Embed free text (query side of hybrid ranking).
    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.embed(text)
    }

    /// Refresh a node's embedding inside the calling transaction.
    ///
    /// A no-op when vectors are disabled, so the write pipelines can call it
    /// unconditionally.
    pub async fn index_in_txn(
        &self,
        conn: &mut SqliteConnection,
        node_id: &str,
        title: &str,
        body: &str,
    ) -> Result<(), EngineError> {
        if !self.enabled {
            return Ok(());
        }
        let vector = self.embedder.embed(&format!("{}\n{}", title, body));
        queries::upsert_embedding(conn, node_id, &vector, Utc::now()).await?;
        Ok(())
    }
}

/// Cosine similarity, zero for mismatched or empty vectors.
pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embeddings_are_deterministic() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.embed("attention is all you need"), e.embed("attention is all you need"));
    }

    #[test]
    fn test_similar_texts_score_higher_than_unrelated() {
        let e = HashEmbedder::new(256);
        let a = e.embed("transformer attention heads");
        let b = e.embed("attention in transformers");
        let c = e.embed("tomato gardening watering schedule");
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }

    #[test]
    fn test_embeddings_are_unit_norm() {
        let e = HashEmbedder::new(32);
        let v = e.embed("some words here");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_guards() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
    }
}

//! Deterministic offline encoder based on feature hashing.
//!
//! Each lowercase alphanumeric token is hashed with BLAKE3 into one of `dim`
//! buckets with a pseudo-random sign; the bucket counts are L2-normalised.
//! Texts sharing words end up with a positive cosine similarity, which is
//! enough for local runs and tests without an embedding server.

use async_trait::async_trait;

use crate::errors::EmbedError;
use crate::EmbeddingsProvider;

#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dim: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        let dim = dim.max(1);
        Self {
            dim,
            model: format!("blake3-hashing-{dim}"),
        }
    }

    /// Embeds one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        let lower = text.to_lowercase();
        let mut any = false;
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = blake3::hash(token.as_bytes());
            let bytes = h.as_bytes();
            let mut idx = [0u8; 8];
            idx.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(idx) % self.dim as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
            any = true;
        }
        if !any {
            v[0] = 1.0;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            // Tokens cancelled out exactly.
            v[0] = 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingsProvider for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

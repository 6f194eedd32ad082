//! Embedding abstraction.
//!
//! Encoders are stateless batch functions: `texts -> vectors`, order-preserving
//! and deterministic for a fixed model. Retry is not the encoder's concern; the
//! ingestor applies its own (by default single-attempt) policy around calls.

use async_trait::async_trait;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::errors::{EmbedError, GeoError};

pub mod hashing;
pub mod ollama;

pub use hashing::HashingEmbedder;
pub use ollama::OllamaEmbedder;

/// Provider interface for embedding generation.
///
/// Implement this trait to plug in your own embedding backend.
#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    /// Embeds every text; the output has the same length and order as `texts`.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Identifier of the model behind this provider.
    fn model_id(&self) -> &str;
}

/// Embeds a single probe text and returns the resulting dimensionality.
pub async fn probe_dimension(provider: &dyn EmbeddingsProvider) -> Result<usize, EmbedError> {
    let v = provider.embed(&["hello".to_string()]).await?;
    match v.into_iter().next() {
        Some(first) if !first.is_empty() => Ok(first.len()),
        Some(_) => Err(EmbedError::Decode("probe returned an empty vector".into())),
        None => Err(EmbedError::CountMismatch { got: 0, want: 1 }),
    }
}

/// Builds the provider selected in the configuration.
pub fn provider_from_config(
    cfg: &EmbeddingConfig,
    timeout: Option<std::time::Duration>,
) -> Result<Box<dyn EmbeddingsProvider>, GeoError> {
    match cfg.backend {
        EmbeddingBackend::Ollama => Ok(Box::new(OllamaEmbedder::new(
            &cfg.endpoint,
            &cfg.model,
            timeout,
        )?)),
        EmbeddingBackend::Hashing => Ok(Box::new(HashingEmbedder::new(cfg.dim))),
    }
}

//! Ollama embedding provider implementation.
//!
//! Calls `POST {endpoint}/api/embed` with a batch of inputs using
//! `reqwest::Client`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::errors::{EmbedError, GeoError};
use crate::EmbeddingsProvider;

/// Ollama embedding provider (async).
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    url_embed: String,
}

impl OllamaEmbedder {
    /// Creates a client for `endpoint` (e.g. `http://localhost:11434`).
    ///
    /// # Errors
    /// - `GeoError::Config` if the endpoint is not an http(s) URL or the model is empty
    /// - `GeoError::Embed` if the HTTP client cannot be built
    pub fn new(endpoint: &str, model: &str, timeout: Option<Duration>) -> Result<Self, GeoError> {
        let endpoint = endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(GeoError::Config(format!(
                "invalid Ollama endpoint: '{endpoint}'"
            )));
        }
        if model.trim().is_empty() {
            return Err(GeoError::Config("embedding model is empty".into()));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let client = builder.build().map_err(EmbedError::from)?;

        Ok(Self {
            client,
            model: model.to_string(),
            url_embed: format!("{}/api/embed", endpoint.trim_end_matches('/')),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingsProvider for OllamaEmbedder {
    #[instrument(skip_all, fields(model = %self.model, batch = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("POST {}", self.url_embed);
        let resp = self
            .client
            .post(&self.url_embed)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let snippet = text.chars().take(240).collect::<String>();
            return Err(EmbedError::HttpStatus { status, snippet });
        }

        let out: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Decode(format!("{e}; expected `{{ embeddings: number[][] }}`")))?;

        if out.embeddings.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                got: out.embeddings.len(),
                want: texts.len(),
            });
        }
        if let Some(first) = out.embeddings.first() {
            let want = first.len();
            if let Some(bad) = out.embeddings.iter().find(|v| v.len() != want) {
                return Err(EmbedError::VectorSizeMismatch {
                    got: bad.len(),
                    want,
                });
            }
        }

        Ok(out.embeddings)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_endpoint() {
        assert!(matches!(
            OllamaEmbedder::new("localhost:11434", "bge-m3", None),
            Err(GeoError::Config(_))
        ));
    }

    #[test]
    fn builds_embed_url_without_double_slash() {
        let e = OllamaEmbedder::new("http://localhost:11434/", "bge-m3", None).unwrap();
        assert_eq!(e.url_embed, "http://localhost:11434/api/embed");
        assert_eq!(e.model_id(), "bge-m3");
    }
}

//! Dense embedding client for an Ollama-compatible endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Produces dense vectors for arbitrary text.
#[async_trait]
pub trait DenseEmbedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. The default implementation loops; backends
    /// with a batch endpoint may override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimension of the vector space.
    fn dimension(&self) -> usize;
}

/// HTTP client for the `/api/embeddings` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl DenseEmbedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| Error::PermanentExternal(format!("embedding response: {e}")))?;

        if body.embedding.len() != self.dimension {
            return Err(Error::PermanentExternal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                body.embedding.len()
            )));
        }

        debug!(model = %self.model, chars = text.len(), "embedded text");
        Ok(body.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

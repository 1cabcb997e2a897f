//! Embedding provider (§4.8 step 4): text/code vectorization for the
//! continuous indexer, behind the same provider-agnostic shape used for
//! [`crate::llm::LlmProvider`] so a local or cloud embedding server can be
//! swapped in without touching the indexer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    Text,
    Code,
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("embedding provider returned an error: {0}")]
    Provider(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(e: reqwest::Error) -> Self {
        EmbedError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one chunk of text. `kind` selects which of the provider's
    /// configured models handles the request (a code model for git source
    /// chunks, a text model for everything else).
    async fn embed(&self, text: &str, kind: EmbeddingKind) -> Result<Vec<f32>, EmbedError>;
}

// ---------------------------------------------------------------------------
// HttpEmbedder — OpenAI-compatible /v1/embeddings endpoint
// ---------------------------------------------------------------------------

pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    text_model: String,
    code_model: String,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
            api_key,
            text_model: "text-embedding-3-small".to_string(),
            code_model: "text-embedding-3-small".to_string(),
        }
    }

    pub fn with_models(mut self, text_model: impl Into<String>, code_model: impl Into<String>) -> Self {
        self.text_model = text_model.into();
        self.code_model = code_model.into();
        self
    }

    fn model_for(&self, kind: EmbeddingKind) -> &str {
        match kind {
            EmbeddingKind::Text => &self.text_model,
            EmbeddingKind::Code => &self.code_model,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str, kind: EmbeddingKind) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&EmbeddingRequest {
            model: self.model_for(kind),
            input: text,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(EmbedError::Provider(format!(
                "embedding request failed with status {}",
                resp.status()
            )));
        }
        let body: EmbeddingResponse = resp.json().await?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Provider("empty embeddings response".to_string()))
    }
}

// ---------------------------------------------------------------------------
// MockEmbedder — deterministic, no network, for tests and key-less dev runs
// ---------------------------------------------------------------------------

pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self { dimensions: 8 }
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str, _kind: EmbeddingKind) -> Result<Vec<f32>, EmbedError> {
        // Deterministic pseudo-embedding derived from a rolling byte hash, so
        // the same text always produces the same vector without a model call.
        let mut state: u64 = 1469598103934665603;
        for byte in text.bytes() {
            state ^= byte as u64;
            state = state.wrapping_mul(1099511628211);
        }
        let mut vector = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let component = ((state >> (i % 32)) & 0xFFFF) as f32 / 65535.0;
            vector.push(component);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new();
        let a = embedder.embed("hello world", EmbeddingKind::Text).await.unwrap();
        let b = embedder.embed("hello world", EmbeddingKind::Text).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn mock_embedder_differs_across_inputs() {
        let embedder = MockEmbedder::new();
        let a = embedder.embed("hello", EmbeddingKind::Text).await.unwrap();
        let b = embedder.embed("goodbye", EmbeddingKind::Text).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn mock_embedder_respects_dimensions() {
        let embedder = MockEmbedder::with_dimensions(16);
        let v = embedder.embed("x", EmbeddingKind::Code).await.unwrap();
        assert_eq!(v.len(), 16);
    }
}

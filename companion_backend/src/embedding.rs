//! Text embedding client.
//!
//! Speaks either the OpenAI-compatible `/embeddings` API or Ollama's
//! `/api/embed`. Both take `{model, input}`; only the response shape differs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingApiStyle;
use crate::http_client::{build_http_client_with_timeout, timeout_from_secs};

/// Maps text to a fixed-dimension vector. Identical input yields identical output.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    style: EmbeddingApiStyle,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    // Some Ollama builds answer /api/embed with the singular legacy field
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl EmbeddingClient {
    pub fn new(
        base_url: String,
        model: String,
        style: EmbeddingApiStyle,
        timeout_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client_with_timeout(timeout_from_secs(timeout_secs))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            style,
        })
    }

    fn endpoint(&self) -> String {
        match self.style {
            EmbeddingApiStyle::Openai => format!("{}/embeddings", self.base_url),
            EmbeddingApiStyle::Ollama => format!("{}/api/embed", self.base_url),
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = self.endpoint();
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .with_context(|| format!("Failed to reach embedding service at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API returned error {}: {}", status, body);
        }

        let body = response
            .text()
            .await
            .context("Failed to read embedding response")?;
        let vector = parse_embedding(self.style, &body)?;
        if vector.is_empty() {
            anyhow::bail!("Embedding service returned an empty vector");
        }
        Ok(vector)
    }
}

fn parse_embedding(style: EmbeddingApiStyle, body: &str) -> Result<Vec<f32>> {
    match style {
        EmbeddingApiStyle::Openai => {
            let parsed: OpenAiEmbeddingResponse =
                serde_json::from_str(body).context("Failed to parse embedding response")?;
            parsed
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| anyhow::anyhow!("Embedding response contained no data"))
        }
        EmbeddingApiStyle::Ollama => {
            let parsed: OllamaEmbeddingResponse =
                serde_json::from_str(body).context("Failed to parse Ollama embedding response")?;
            parsed
                .embeddings
                .into_iter()
                .next()
                .or(parsed.embedding)
                .ok_or_else(|| anyhow::anyhow!("Ollama response contained no embeddings"))
        }
    }
}

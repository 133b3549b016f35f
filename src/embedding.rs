//! Embedding providers for template matching.
//!
//! Implements [`Embedder`] for:
//! - **[`DisabledEmbedder`]**: fails every call; matching then reports
//!   embeddings as disabled.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama instance.
//!
//! # Retry Strategy
//!
//! Both network providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use compileflow_core::embedding::Embedder;

use crate::config::EmbeddingConfig;

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

/// Shared HTTP settings of the network providers.
struct HttpEmbedding {
    client: reqwest::Client,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl HttpEmbedding {
    fn from_config(config: &EmbeddingConfig, provider: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", provider))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }

    /// POST `body` with retry/backoff and return the parsed JSON.
    async fn post_json(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(key) = bearer {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(provider = label, %status, attempt, "embedding request failed, retrying");
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }

                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
    }

    fn check_dims(&self, vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != expected {
            bail!(
                "embedding response has {} vectors for {} inputs",
                vectors.len(),
                expected
            );
        }
        if let Some(v) = vectors.iter().find(|v| v.len() != self.dims) {
            bail!(
                "embedding has {} dimensions, configured embedding.dims is {}",
                v.len(),
                self.dims
            );
        }
        Ok(vectors)
    }
}

fn float_array(value: &Value, what: &str) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", what))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

pub struct OpenAIEmbedder {
    http: HttpEmbedding,
    api_key: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = HttpEmbedding::from_config(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self { http, api_key })
    }
}

/// `data[]` sorted by `index` so vectors line up with the inputs.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(Value::as_u64).unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, float_array(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }
    fn dims(&self) -> usize {
        self.http.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.http.model, "input": texts });
        let json = self
            .http
            .post_json(
                "OpenAI",
                "https://api.openai.com/v1/embeddings",
                Some(&self.api_key),
                &body,
            )
            .await?;
        self.http.check_dims(parse_openai_response(&json)?, texts.len())
    }
}

pub struct OllamaEmbedder {
    http: HttpEmbedding,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let http = HttpEmbedding::from_config(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| float_array(e, "Ollama"))
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }
    fn dims(&self) -> usize {
        self.http.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.http.model, "input": texts });
        let url = format!("{}/api/embed", self.url);
        let json = self.http.post_json("Ollama", &url, None, &body).await?;
        self.http.check_dims(parse_ollama_response(&json)?, texts.len())
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_orders_by_index() {
        let resp = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&resp).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&json!({})).is_err());
    }

    #[test]
    fn test_parse_ollama() {
        let resp = json!({"embeddings": [[0.5, 0.25]]});
        assert_eq!(parse_ollama_response(&resp).unwrap(), vec![vec![0.5, 0.25]]);
        assert!(parse_ollama_response(&json!({"embeddings": [1]})).is_err());
    }

    #[test]
    fn test_dims_checked() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(2),
            ..EmbeddingConfig::default()
        };
        let http = HttpEmbedding::from_config(&config, "Ollama").unwrap();
        assert!(http.check_dims(vec![vec![1.0, 2.0]], 1).is_ok());
        assert!(http.check_dims(vec![vec![1.0]], 1).is_err());
        assert!(http.check_dims(vec![], 1).is_err());
    }

    #[tokio::test]
    async fn test_disabled_and_factory() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.model_name(), "disabled");
        assert!(embedder.embed_one("x").await.is_err());

        let unknown = EmbeddingConfig {
            provider: "local".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&unknown).is_err());
    }
}

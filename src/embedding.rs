//! Embedding provider implementations.
//!
//! - **[`OpenAIEmbedder`]**: `POST {url}/embeddings` (OpenAI-compatible).
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama.
//! - **[`HashEmbedder`]**: deterministic offline feature hashing, from
//!   `deepwiki-core`.
//! - **[`DisabledEmbedder`]**: refuses to embed.
//!
//! Network providers are wrapped in a [`RetryingEmbedder`] by
//! [`create_embedder`].
//!
//! # Error mapping
//!
//! - HTTP 429 → `rate_limited` (retried)
//! - HTTP 5xx and network errors → `model_unavailable` (retried)
//! - Other HTTP 4xx → `internal` (not retried)

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use deepwiki_core::embedding::Embedder;
pub use deepwiki_core::embedding::HashEmbedder;
use deepwiki_core::{Error, Result};

use crate::config::Config;
use crate::retry::{with_backoff, Backoff};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_HASH_DIMS: usize = 256;

/// Map a non-success model API response to an error kind.
pub(crate) fn model_http_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("{provider} API error {status}: {}", body.trim());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::RateLimited(message)
    } else if status.is_server_error() {
        Error::ModelUnavailable(message)
    } else {
        Error::Internal(message)
    }
}

pub(crate) fn model_network_error(provider: &str, url: &str, err: reqwest::Error) -> Error {
    Error::ModelUnavailable(format!("{provider} unreachable at {url}: {err}"))
}

pub(crate) fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("deepwiki/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn check_batch(provider: &str, dims: usize, texts: &[String], vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != texts.len() {
        return Err(Error::Internal(format!(
            "{provider} returned {} embeddings for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::Internal(format!(
            "{provider} returned a {}-dimensional embedding, expected {dims}",
            v.len()
        )));
    }
    Ok(())
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIEmbedder {
    /// Reads `OPENAI_API_KEY` from the environment.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let e = &config.embedding;
        let model = e
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = e
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let url = e.url.clone().unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        Self::with_key(&url, &api_key, &model, dims, e.timeout_secs)
    }

    pub fn with_key(
        url: &str,
        api_key: &str,
        model: &str,
        dims: usize,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = format!("{}/embeddings", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| model_network_error("OpenAI", &endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(model_http_error("OpenAI", status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("OpenAI returned an unreadable body: {e}")))?;
        let vectors = parse_openai_response(&json)?;
        check_batch("OpenAI", self.dims, texts, &vectors)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Internal("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Internal("Invalid OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Embedder backed by a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let e = &config.embedding;
        let model = e
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = e
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = e.url.clone().unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            client: http_client(e.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = format!("{}/api/embed", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| model_network_error("Ollama", &endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(model_http_error("Ollama", status, &text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("Ollama returned an unreadable body: {e}")))?;
        let vectors = parse_ollama_response(&json)?;
        check_batch("Ollama", self.dims, texts, &vectors)?;
        Ok(vectors)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::Internal("Invalid Ollama response: missing embeddings array".into()))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                })
                .ok_or_else(|| {
                    Error::Internal("Invalid Ollama response: embedding is not an array".into())
                })
        })
        .collect()
}

/// Used when `embedding.provider = "disabled"`: indexing and questions
/// fail with a configuration hint.
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
        Err(Error::InvalidArgument(
            "embeddings are disabled; set [embedding] provider to hash, openai or ollama".into(),
        ))
    }
}

/// Decorator that retries transient failures of the inner embedder.
pub struct RetryingEmbedder {
    inner: Arc<dyn Embedder>,
    backoff: Backoff,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        with_backoff("embed", &self.backoff, || self.inner.embed(texts)).await
    }
}

/// Instantiate the configured embedder.
pub fn create_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    let backoff = Backoff::from_config(&config.retry, config.embedding.max_retries);
    let embedder: Arc<dyn Embedder> = match config.embedding.provider.as_str() {
        "disabled" => Arc::new(DisabledEmbedder),
        "hash" => Arc::new(HashEmbedder::new(
            config.embedding.dims.unwrap_or(DEFAULT_HASH_DIMS),
        )),
        "openai" => Arc::new(RetryingEmbedder::new(
            Arc::new(OpenAIEmbedder::new(config)?),
            backoff,
        )),
        "ollama" => Arc::new(RetryingEmbedder::new(
            Arc::new(OllamaEmbedder::new(config)?),
            backoff,
        )),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(embedder)
}

#[cfg(test)]
mod tests {
    use deepwiki_core::ErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn openai_response_is_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn ollama_response_rejects_non_arrays() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5], "nope"]});
        assert!(parse_ollama_response(&json).is_err());
    }

    #[tokio::test]
    async fn openai_embedder_calls_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 0, "embedding": [0.1, 0.2, 0.3]},
                    {"index": 1, "embedding": [0.4, 0.5, 0.6]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let e = OpenAIEmbedder::with_key(&format!("{}/v1", server.uri()), "sk-test", "m", 3, 5)
            .unwrap();
        let v = e
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[1], vec![0.4, 0.5, 0.6]);
    }

    #[tokio::test]
    async fn status_codes_map_to_error_kinds() {
        for (status, kind) in [
            (429, ErrorKind::RateLimited),
            (503, ErrorKind::ModelUnavailable),
            (400, ErrorKind::Internal),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;
            let e = OpenAIEmbedder::with_key(&server.uri(), "k", "m", 3, 5).unwrap();
            let err = e.embed(&["a".to_string()]).await.unwrap_err();
            assert_eq!(err.kind(), kind, "status {status}");
        }
    }

    #[tokio::test]
    async fn unreachable_model_is_model_unavailable() {
        // Port 9 (discard) is closed on test machines.
        let e = OpenAIEmbedder::with_key("http://127.0.0.1:9", "k", "m", 3, 2).unwrap();
        let err = e.embed(&["a".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.1, 0.2]}]
            })))
            .mount(&server)
            .await;
        let e = OpenAIEmbedder::with_key(&server.uri(), "k", "m", 3, 5).unwrap();
        assert!(e.embed(&["a".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn retrying_embedder_recovers_from_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0]}]
            })))
            .mount(&server)
            .await;

        let inner = Arc::new(OpenAIEmbedder::with_key(&server.uri(), "k", "m", 1, 5).unwrap());
        let e = RetryingEmbedder::new(
            inner,
            Backoff {
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
                max_retries: 2,
            },
        );
        assert_eq!(e.embed(&["a".to_string()]).await.unwrap(), vec![vec![1.0]]);
    }

    #[test]
    fn create_embedder_defaults_to_hash() {
        let config = Config::minimal("x.sqlite");
        let e = create_embedder(&config).unwrap();
        assert_eq!(e.model_name(), "hash");
        assert_eq!(e.dims(), 256);
    }
}

//! Chat-completion backends for grounded answers.
//!
//! [`OpenAIChat`] talks to an OpenAI-compatible `/chat/completions`
//! endpoint and [`OllamaChat`] to Ollama's `/api/chat`. Both retry
//! transient failures with the configured backoff and map HTTP failures
//! the same way the embedders do.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use deepwiki_core::answer::AnswerModel;
use deepwiki_core::{Error, Result};

use crate::config::Config;
use crate::embedding::{http_client, model_http_error, model_network_error};
use crate::retry::{with_backoff, Backoff};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub struct OpenAIChat {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    backoff: Backoff,
}

impl OpenAIChat {
    /// Reads `OPENAI_API_KEY` from the environment.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let g = &config.generation;
        let model = g
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let url = g.url.clone().unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let mut chat = Self::with_key(&url, &api_key, &model, g.timeout_secs)?;
        chat.temperature = g.temperature;
        chat.backoff = Backoff::from_config(&config.retry, g.max_retries);
        Ok(chat)
    }

    pub fn with_key(url: &str, api_key: &str, model: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature: 0.0,
            backoff: Backoff::none(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn complete_once(&self, system: &str, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
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
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("Invalid OpenAI response: missing message content".into()))
    }
}

#[async_trait]
impl AnswerModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        with_backoff("chat completion", &self.backoff, || {
            self.complete_once(system, prompt)
        })
        .await
    }
}

pub struct OllamaChat {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    backoff: Backoff,
}

impl OllamaChat {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let g = &config.generation;
        let model = g
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let url = g.url.clone().unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            client: http_client(g.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            temperature: g.temperature,
            backoff: Backoff::from_config(&config.retry, g.max_retries),
        })
    }

    async fn complete_once(&self, system: &str, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/api/chat", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": {"temperature": self.temperature},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
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
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("Invalid Ollama response: missing message content".into()))
    }
}

#[async_trait]
impl AnswerModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        with_backoff("chat completion", &self.backoff, || {
            self.complete_once(system, prompt)
        })
        .await
    }
}

/// Instantiate the configured answer model, or `None` when generation is
/// disabled.
pub fn create_answer_model(config: &Config) -> anyhow::Result<Option<Arc<dyn AnswerModel>>> {
    let model: Arc<dyn AnswerModel> = match config.generation.provider.as_str() {
        "disabled" => return Ok(None),
        "openai" => Arc::new(OpenAIChat::new(config)?),
        "ollama" => Arc::new(OllamaChat::new(config)?),
        other => bail!("Unknown generation provider: {}", other),
    };
    Ok(Some(model))
}

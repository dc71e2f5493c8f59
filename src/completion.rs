//! Completion (text generation) backends used by the QA synthesizer.
//!
//! A [`Completer`] turns a prompt into answer text. Backends:
//! - **[`DisabledCompleter`]** — always unavailable; QA falls back to excerpts.
//! - **[`OllamaCompleter`]** — `POST /api/generate` on a local Ollama.
//! - **[`OpenAICompleter`]** — `POST /v1/chat/completions`, needs `OPENAI_API_KEY`.
//!
//! Every failure maps to [`Error::CompletionUnavailable`]; callers decide
//! whether to degrade.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Completer: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledCompleter;

#[async_trait]
impl Completer for DisabledCompleter {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(Error::CompletionUnavailable(
            "completion provider is disabled".to_string(),
        ))
    }
}

fn unavailable(e: impl std::fmt::Display) -> Error {
    Error::CompletionUnavailable(e.to_string())
}

pub struct OllamaCompleter {
    client: reqwest::Client,
    model: String,
    url: String,
}

impl OllamaCompleter {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, model, url })
    }
}

#[async_trait]
impl Completer for OllamaCompleter {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": 0.3, "top_p": 0.9, "num_predict": 500 },
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(unavailable(format!("Ollama API error {}", response.status())));
        }
        let json: serde_json::Value = response.json().await.map_err(unavailable)?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| unavailable("Invalid Ollama response: missing response field"))
    }
}

pub struct OpenAICompleter {
    client: reqwest::Client,
    model: String,
    api_key: String,
    url: String,
}

impl OpenAICompleter {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            api_key,
            url,
        })
    }
}

#[async_trait]
impl Completer for OpenAICompleter {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(unavailable(format!("OpenAI API error {}", response.status())));
        }
        let json: serde_json::Value = response.json().await.map_err(unavailable)?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| unavailable("Invalid OpenAI response: missing message content"))
    }
}

/// Create the [`Completer`] named by `config.provider`.
pub fn create_completer(config: &CompletionConfig) -> anyhow::Result<Arc<dyn Completer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompleter)),
        "ollama" => Ok(Arc::new(OllamaCompleter::new(config)?)),
        "openai" => Ok(Arc::new(OpenAICompleter::new(config)?)),
        other => anyhow::bail!("Unknown completion provider: {}", other),
    }
}

//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to defaults that
//! match a small local deployment. See `config/kb.example.toml`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_size_tokens")]
    pub size_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size_tokens: default_size_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_size_tokens() -> usize {
    1000
}
fn default_overlap_tokens() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Lower bar used by the completeness assessor for `partial` coverage.
    #[serde(default = "default_partial_threshold")]
    pub partial_threshold: f32,
    /// Threshold applied when retrieving context for QA.
    #[serde(default = "default_qa_threshold")]
    pub qa_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            partial_threshold: default_partial_threshold(),
            qa_threshold: default_qa_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_partial_threshold() -> f32 {
    0.5
}
fn default_qa_threshold() -> f32 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_completion_timeout_secs(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_max_context_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_max_in_flight() -> usize {
    4
}
fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            debounce_ms: default_debounce_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.txt".to_string(),
        "**/*.md".to_string(),
    ]
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_channel_capacity() -> usize {
    1024
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.size_tokens == 0 {
        anyhow::bail!("chunking.size_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.size_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.size_tokens");
    }

    // Retrieval
    let r = &config.retrieval;
    for (name, value) in [
        ("similarity_threshold", r.similarity_threshold),
        ("partial_threshold", r.partial_threshold),
        ("qa_threshold", r.qa_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if r.partial_threshold > r.similarity_threshold {
        anyhow::bail!("retrieval.partial_threshold must be <= retrieval.similarity_threshold");
    }
    if r.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Embedding
    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "hashing" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, openai, or ollama.",
            other
        ),
    }
    if e.is_enabled() {
        if e.dims.is_none() || e.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() && e.provider != "hashing" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                e.provider
            );
        }
    }
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Completion
    match config.completion.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }

    // Ingest / watch
    if config.ingest.max_in_flight == 0 {
        anyhow::bail!("ingest.max_in_flight must be >= 1");
    }
    if config.watch.channel_capacity == 0 {
        anyhow::bail!("watch.channel_capacity must be >= 1");
    }

    Ok(())
}

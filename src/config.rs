//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! Secrets never live in the file: `GITHUB_TOKEN` and `OPENAI_API_KEY`
//! are read from the environment by the components that need them.

use anyhow::{Context, Result};
use deepwiki_core::answer::{GenerationMode, DEFAULT_RELEVANCE_THRESHOLD};
use deepwiki_core::chunk::tokens_to_chars;
use deepwiki_core::retrieve::DEFAULT_TOP_K;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    /// `github` (REST API) or `git` (shallow clone).
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_web_url")]
    pub web_url: String,
    /// Globs matched against top-level file names.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    /// Directories whose direct children are candidates.
    #[serde(default = "default_doc_dirs")]
    pub doc_dirs: Vec<String>,
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    /// Clone cache for the `git` source.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub shallow: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            api_url: default_api_url(),
            web_url: default_web_url(),
            include_globs: default_include_globs(),
            doc_dirs: default_doc_dirs(),
            max_documents: default_max_documents(),
            max_file_bytes: default_max_file_bytes(),
            timeout_secs: default_fetch_timeout(),
            max_retries: default_fetch_retries(),
            cache_dir: None,
            shallow: true,
        }
    }
}

fn default_source() -> String {
    "github".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_web_url() -> String {
    "https://github.com".to_string()
}
fn default_include_globs() -> Vec<String> {
    ["*.md", "*.markdown", "*.rst", "*.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_doc_dirs() -> Vec<String> {
    vec!["docs".to_string()]
}
fn default_max_documents() -> usize {
    25
}
fn default_max_file_bytes() -> u64 {
    512 * 1024
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn max_chars(&self) -> usize {
        tokens_to_chars(self.max_tokens)
    }

    pub fn overlap_chars(&self) -> usize {
        tokens_to_chars(self.overlap_tokens)
    }
}

fn default_max_tokens() -> usize {
    300
}
fn default_overlap() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, `ollama` or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches in flight at once during indexing.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub relevance_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            relevance_threshold: default_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}
fn default_threshold() -> f32 {
    DEFAULT_RELEVANCE_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_mode")]
    pub mode: GenerationMode,
    /// `openai`, `ollama` or `disabled`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: default_generation_mode(),
            provider: default_generation_provider(),
            model: None,
            url: None,
            timeout_secs: default_generation_timeout(),
            max_retries: default_max_retries(),
            temperature: 0.0,
        }
    }
}

fn default_generation_mode() -> GenerationMode {
    GenerationMode::RetrievalOnly
}
fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_generation_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Terminal tasks older than this are pruned.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// How often workers re-scan the task table for pending work.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retention_hours: default_retention_hours(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_retention_hours() -> u64 {
    168
}
fn default_poll_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    32_000
}

impl Config {
    /// Defaults everywhere, with the database at `db_path`. Generation runs
    /// in `retrieval_only` mode so no model provider is needed.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            fetch: FetchConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            tasks: TasksConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }

        match self.fetch.source.as_str() {
            "github" | "git" => {}
            other => anyhow::bail!("Unknown fetch source: '{}'. Must be github or git.", other),
        }
        if self.fetch.max_documents == 0 {
            anyhow::bail!("fetch.max_documents must be >= 1");
        }
        for glob in &self.fetch.include_globs {
            globset::Glob::new(glob)
                .with_context(|| format!("Invalid fetch.include_globs pattern: {glob}"))?;
        }

        if self.retrieval.top_k < 1 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.relevance_threshold) {
            anyhow::bail!("retrieval.relevance_threshold must be in [-1.0, 1.0]");
        }

        match self.embedding.provider.as_str() {
            "hash" | "disabled" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    anyhow::bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or disabled.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            anyhow::bail!("embedding.batch_size and embedding.concurrency must be >= 1");
        }

        match self.generation.provider.as_str() {
            "disabled" => {
                if self.generation.mode == GenerationMode::Generative {
                    anyhow::bail!(
                        "generation.mode = \"generative\" needs generation.provider; \
                         set it or use mode = \"retrieval_only\""
                    );
                }
            }
            "openai" | "ollama" => {
                if self.generation.model.is_none() {
                    anyhow::bail!(
                        "generation.model must be specified when provider is '{}'",
                        self.generation.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown generation provider: '{}'. Must be openai, ollama, or disabled.",
                other
            ),
        }

        if self.tasks.workers == 0 {
            anyhow::bail!("tasks.workers must be >= 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"./data/dw.sqlite\"\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.fetch.source, "github");
        assert_eq!(config.chunking.max_chars(), 1200);
        assert_eq!(config.chunking.overlap_chars(), 160);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.generation.mode, GenerationMode::RetrievalOnly);
    }

    #[test]
    fn generative_mode_needs_a_provider() {
        let config: Config = toml::from_str(
            "[db]\npath = \"x\"\n[generation]\nmode = \"generative\"\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("generation.provider"), "{err}");
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk() {
        let config: Config = toml::from_str(
            "[db]\npath = \"x\"\n[chunking]\nmax_tokens = 10\noverlap_tokens = 10\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_embedder_needs_model_and_dims() {
        let config: Config = toml::from_str(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        )
        .unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("dims"));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let mut config = Config::minimal("x");
        config.fetch.source = "svn".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../config/deepwiki.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tasks.workers, 2);
        assert_eq!(config.fetch.doc_dirs, vec!["docs".to_string()]);
    }
}

//! TOML configuration.
//!
//! Every section is optional; an empty file yields a working local setup
//! with the model and embeddings disabled. Secrets never live in the file:
//! `GEMINI_API_KEY` and `OPENAI_API_KEY` are read from the environment
//! (optionally via a `.env` file loaded at startup).
//!
//! ```toml
//! [db]
//! path = "./data/compileflow.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//!
//! [model]
//! provider = "gemini"
//! model = "gemini-2.5-flash"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [storage]
//! root = "./data/blobs"
//! public_base_url = "http://127.0.0.1:7341"
//!
//! [pipeline]
//! chunk_threshold_pages = 3
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/compileflow.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// Multimodal model used for classification, suggestion, extraction, and
/// the orchestrator.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `disabled` or `gemini`.
    #[serde(default = "default_model_provider")]
    pub provider: String,
    #[serde(default = "default_model_name")]
    pub model: String,
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_model_provider(),
            model: default_model_name(),
            base_url: default_model_base_url(),
            timeout_secs: default_model_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_model_provider() -> String {
    "disabled".to_string()
}
fn default_model_name() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_model_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_max_output_tokens() -> u32 {
    65536
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Ollama base URL; defaults to `http://localhost:11434`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Blob storage for uploaded files and rendered excerpts.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Prefix of resolved file URLs; the server serves blobs under `/files/`.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_public_base_url() -> String {
    format!("http://{}", default_bind())
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// PDFs with more pages than this are extracted in windows.
    #[serde(default = "default_chunk_threshold_pages")]
    pub chunk_threshold_pages: u32,
    #[serde(default = "default_chunk_window")]
    pub chunk_window: u32,
    #[serde(default = "default_chunk_step")]
    pub chunk_step: u32,
    #[serde(default = "default_match_top_k")]
    pub match_top_k: usize,
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_pages: default_chunk_threshold_pages(),
            chunk_window: default_chunk_window(),
            chunk_step: default_chunk_step(),
            match_top_k: default_match_top_k(),
            max_agent_steps: default_max_agent_steps(),
        }
    }
}

fn default_chunk_threshold_pages() -> u32 {
    3
}
fn default_chunk_window() -> u32 {
    compileflow_core::chunk::DEFAULT_WINDOW
}
fn default_chunk_step() -> u32 {
    compileflow_core::chunk::DEFAULT_STEP
}
fn default_match_top_k() -> usize {
    5
}
fn default_max_agent_steps() -> usize {
    8
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Range and consistency checks shared by file-loaded and programmatic configs.
pub fn validate(config: &Config) -> Result<()> {
    let p = &config.pipeline;
    if p.chunk_window == 0 {
        bail!("pipeline.chunk_window must be > 0");
    }
    if p.chunk_step == 0 || p.chunk_step > p.chunk_window {
        bail!("pipeline.chunk_step must be in 1..=chunk_window");
    }
    if p.match_top_k == 0 {
        bail!("pipeline.match_top_k must be >= 1");
    }
    if p.max_agent_steps == 0 {
        bail!("pipeline.max_agent_steps must be >= 1");
    }

    match config.model.provider.as_str() {
        "disabled" | "gemini" => {}
        other => bail!(
            "Unknown model provider: '{}'. Must be disabled or gemini.",
            other
        ),
    }
    if config.model.is_enabled() && config.model.model.trim().is_empty() {
        bail!("model.model must be specified when provider is '{}'", config.model.provider);
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

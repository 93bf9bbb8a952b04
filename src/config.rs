use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kgrag: KgragConfig,
    pub embeddings: EmbeddingsConfig,
    pub llm: LlmConfig,
    pub inference: InferenceConfig,
    pub build: BuildConfig,
    pub agent: AgentConfig,
}

/// Storage locations and logging
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KgragConfig {
    /// SQLite file backing the graph store.
    pub graph_db_path: PathBuf,
    /// Directory holding the persisted vector index.
    pub index_dir: PathBuf,
    pub log_level: String,
}

impl Default for KgragConfig {
    fn default() -> Self {
        Self {
            graph_db_path: PathBuf::from("kgrag_graph.db"),
            index_dir: PathBuf::from("kgrag_index"),
            log_level: "info".to_string(),
        }
    }
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// `openai` or `hashing` (local, offline).
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub base_url: String,
    pub batch_size: usize,
    pub dimensions: usize,
    pub cache_capacity: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            batch_size: 100,
            dimensions: 384,
            cache_capacity: 1000,
        }
    }
}

/// LLM completion service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    /// Timeout applied to every planning, finalizing and refinement call.
    pub timeout_secs: u64,
    /// Prompts longer than this are cut before being sent.
    pub max_input_chars: usize,
    pub max_tokens: u32,
    /// Run the advisory ontology refinement pass during builds.
    pub refine_ontology: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
            max_input_chars: 24_000,
            max_tokens: 1024,
            refine_ontology: true,
        }
    }
}

/// Implicit relationship inference thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub name_similarity_threshold: f32,
    pub value_overlap_threshold: f32,
    /// Distinct values sampled per column for overlap checks.
    pub sample_limit: usize,
    /// Minimum confidence for an inferred link to become a graph relationship.
    pub relationship_confidence_threshold: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            name_similarity_threshold: 0.6,
            value_overlap_threshold: 0.8,
            sample_limit: 1000,
            relationship_confidence_threshold: 0.75,
        }
    }
}

/// Graph build batching and retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub batch_size: usize,
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

/// Agent loop bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub observation_max_chars: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub filter_limit: usize,
    pub cypher_row_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            observation_max_chars: 4000,
            default_top_k: 5,
            max_top_k: 50,
            filter_limit: 20,
            cypher_row_limit: 25,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in KGRAG_CONFIG environment variable
    /// 2. ./config.toml in current directory
    /// 3. Built-in defaults when neither exists
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("KGRAG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config = if config_path.exists() {
            Self::from_file(&config_path)?
        } else if std::env::var("KGRAG_CONFIG").is_ok() {
            anyhow::bail!("Config file not found: {}", config_path.display());
        } else {
            log::debug!("No config.toml found, using built-in defaults");
            Config::default()
        };

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file without consulting the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.embeddings.provider.as_str() {
            "hashing" => {}
            "openai" => {
                std::env::var(&self.embeddings.api_key_env).with_context(|| {
                    format!(
                        "Environment variable {} not set. Set it in your .env file or use embeddings.provider = \"hashing\".",
                        self.embeddings.api_key_env
                    )
                })?;
            }
            other => anyhow::bail!("Unknown embeddings.provider: {}", other),
        }

        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }

        if self.embeddings.batch_size == 0 {
            anyhow::bail!("embeddings.batch_size must be greater than 0");
        }

        for (name, value) in [
            ("inference.name_similarity_threshold", self.inference.name_similarity_threshold),
            ("inference.value_overlap_threshold", self.inference.value_overlap_threshold),
            (
                "inference.relationship_confidence_threshold",
                self.inference.relationship_confidence_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }

        if self.inference.sample_limit < 2 {
            anyhow::bail!("inference.sample_limit must be at least 2");
        }

        if self.build.batch_size == 0 {
            anyhow::bail!("build.batch_size must be greater than 0");
        }

        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.max_iterations must be greater than 0");
        }

        if self.agent.default_top_k == 0 || self.agent.default_top_k > self.agent.max_top_k {
            anyhow::bail!("agent.default_top_k must be between 1 and agent.max_top_k");
        }

        if self.agent.observation_max_chars < 200 {
            anyhow::bail!("agent.observation_max_chars must be at least 200");
        }

        if self.llm.timeout_secs == 0 {
            anyhow::bail!("llm.timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Get graph store path
    pub fn graph_db_path(&self) -> &Path {
        &self.kgrag.graph_db_path
    }

    /// Get vector index directory
    pub fn index_dir(&self) -> &Path {
        &self.kgrag.index_dir
    }
}

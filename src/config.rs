use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Compress before assembling the prompt of the turn that crossed the high-water mark.
    Inline,
    /// Spawn compression and let the current turn use the unmodified summary.
    Background,
}

impl Default for CompressionMode {
    fn default() -> Self {
        CompressionMode::Inline
    }
}

impl CompressionMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inline" | "sync" => Some(CompressionMode::Inline),
            "background" | "async" => Some(CompressionMode::Background),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Unsummarized turn count above which compression runs.
    #[serde(default = "default_threshold_high")]
    pub threshold_high: usize,
    /// Number of oldest unsummarized turns folded into the summary per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub compression_mode: CompressionMode,
    #[serde(default = "default_summarization_timeout_secs")]
    pub summarization_timeout_secs: u64,
}

fn default_threshold_high() -> usize {
    10
}

fn default_batch_size() -> usize {
    5
}

fn default_summarization_timeout_secs() -> u64 {
    30
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold_high: default_threshold_high(),
            batch_size: default_batch_size(),
            compression_mode: CompressionMode::default(),
            summarization_timeout_secs: default_summarization_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retrieval_k")]
    pub k: usize,
    #[serde(default = "default_dedupe_threshold")]
    pub dedupe_threshold: f32,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default = "default_retrieval_timeout_secs")]
    pub timeout_secs: u64,

    // Embedding service (OpenAI-compatible /embeddings)
    #[serde(default = "default_embedding_url")]
    pub embedding_api_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,

    // Vector index (Qdrant REST)
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default)]
    pub qdrant_api_key: Option<String>,
    #[serde(default = "default_qdrant_collection")]
    pub qdrant_collection: String,
}

fn default_true() -> bool {
    true
}

fn default_retrieval_k() -> usize {
    5
}

fn default_dedupe_threshold() -> f32 {
    0.92
}

fn default_retrieval_timeout_secs() -> u64 {
    10
}

fn default_embedding_url() -> String {
    "https://api.voyageai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "voyage-3-large".to_string()
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_qdrant_collection() -> String {
    "manual_pages".to_string()
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: default_retrieval_k(),
            dedupe_threshold: default_dedupe_threshold(),
            min_score: None,
            timeout_secs: default_retrieval_timeout_secs(),
            embedding_api_url: default_embedding_url(),
            embedding_model: default_embedding_model(),
            embedding_api_key: None,
            qdrant_url: default_qdrant_url(),
            qdrant_api_key: None,
            qdrant_collection: default_qdrant_collection(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Longest silence tolerated between two streamed fragments.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // LLM configuration (OpenAI-compatible: Groq, Ollama, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Cheaper model used for rolling summaries.
    #[serde(default)]
    pub llm_fast_model: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Upper bound on the rendered prompt, in characters.
    #[serde(default = "default_prompt_budget_chars")]
    pub prompt_budget_chars: usize,

    /// Delay before the single automatic retry after losing a per-chat race.
    #[serde(default = "default_conflict_retry_delay_ms")]
    pub conflict_retry_delay_ms: u64,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_llm_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant. \
     Use the provided long-term summary, recent history, and reference material when they are relevant."
        .to_string()
}

fn default_prompt_budget_chars() -> usize {
    24_000
}

fn default_conflict_retry_delay_ms() -> u64 {
    50
}

fn default_database_path() -> String {
    "chatloom.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_fast_model: None,
            llm_api_key: None,
            system_prompt: default_system_prompt(),
            prompt_budget_chars: default_prompt_budget_chars(),
            conflict_retry_delay_ms: default_conflict_retry_delay_ms(),
            database_path: default_database_path(),
            memory: MemoryConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("chatloom_config.toml")
    }

    /// Load config from chatloom_config.toml (next to executable), falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.validated();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env().validated()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(model) = env::var("LLM_FAST_MODEL") {
            if !model.trim().is_empty() {
                config.llm_fast_model = Some(model);
            }
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(url) = env::var("EMBEDDING_API_URL") {
            config.retrieval.embedding_api_url = url;
        }

        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            config.retrieval.embedding_model = model;
        }

        if let Ok(key) = env::var("EMBEDDING_API_KEY") {
            config.retrieval.embedding_api_key = Some(key);
        }

        if let Ok(url) = env::var("QDRANT_URL") {
            config.retrieval.qdrant_url = url;
        }

        if let Ok(key) = env::var("QDRANT_API_KEY") {
            config.retrieval.qdrant_api_key = Some(key);
        }

        if let Ok(collection) = env::var("QDRANT_COLLECTION") {
            if !collection.trim().is_empty() {
                config.retrieval.qdrant_collection = collection;
            }
        }

        if let Ok(enabled) = env::var("CHATLOOM_ENABLE_RETRIEVAL") {
            config.retrieval.enabled = parse_flag(&enabled);
        }

        if let Ok(path) = env::var("CHATLOOM_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(mode) = env::var("CHATLOOM_COMPRESSION_MODE") {
            match CompressionMode::parse(&mode) {
                Some(mode) => config.memory.compression_mode = mode,
                None => tracing::warn!("Ignoring unknown CHATLOOM_COMPRESSION_MODE '{}'", mode),
            }
        }

        if let Ok(threshold) = env::var("CHATLOOM_SUMMARY_THRESHOLD") {
            if let Ok(value) = threshold.parse() {
                config.memory.threshold_high = value;
            }
        }

        if let Ok(batch) = env::var("CHATLOOM_SUMMARY_BATCH") {
            if let Ok(value) = batch.parse() {
                config.memory.batch_size = value;
            }
        }

        config
    }

    /// Model used for summarization calls.
    pub fn summary_model(&self) -> &str {
        self.llm_fast_model
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or(&self.llm_model)
    }

    /// Clamp values that would make the compression policy degenerate.
    pub fn validated(mut self) -> Self {
        if self.memory.batch_size == 0 {
            tracing::warn!("memory.batch_size must be at least 1; using 1");
            self.memory.batch_size = 1;
        }
        // The newest unsummarized turn (the one being answered) must never
        // fall into a batch.
        if self.memory.threshold_high <= self.memory.batch_size {
            tracing::warn!(
                "memory.threshold_high ({}) must exceed memory.batch_size ({}); using {}",
                self.memory.threshold_high,
                self.memory.batch_size,
                self.memory.batch_size + 1
            );
            self.memory.threshold_high = self.memory.batch_size + 1;
        }
        if self.retrieval.k == 0 {
            self.retrieval.k = default_retrieval_k();
        }
        if !(0.0..=1.0).contains(&self.retrieval.dedupe_threshold) {
            tracing::warn!(
                "retrieval.dedupe_threshold {} out of range; using {}",
                self.retrieval.dedupe_threshold,
                default_dedupe_threshold()
            );
            self.retrieval.dedupe_threshold = default_dedupe_threshold();
        }
        self
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

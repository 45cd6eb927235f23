use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters for retrieval chunks.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters of overlap between adjacent windows. Must be < chunk_size.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    /// Character budget for the sequential summarization context.
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            summary_window: default_summary_window(),
        }
    }
}

fn default_chunk_size() -> usize {
    1500
}
fn default_overlap() -> usize {
    200
}
fn default_summary_window() -> usize {
    6000
}

/// Scanned-document heuristic. The thresholds are untuned product values,
/// kept as configuration rather than constants.
#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// A page with at least this many (trimmed) chars counts as text-bearing.
    #[serde(default = "default_min_chars_per_page")]
    pub min_chars_per_page: usize,
    /// Below this ratio of text-bearing pages the document is scanned.
    #[serde(default = "default_text_page_ratio")]
    pub text_page_ratio: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_chars_per_page: default_min_chars_per_page(),
            text_page_ratio: default_text_page_ratio(),
        }
    }
}

fn default_min_chars_per_page() -> usize {
    50
}
fn default_text_page_ratio() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Chunk count for the sequential (page-order) summary context.
    #[serde(default = "default_sequential_limit")]
    pub sequential_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            sequential_limit: default_sequential_limit(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.5
}
fn default_sequential_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` (OpenAI-compatible HTTP endpoint) or `"disabled"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            endpoint: default_embedding_endpoint(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
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
    "disabled".to_string()
}
fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Attempts for the retrying summarizer path (base 1s, doubling).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Conversation turns carried into each completion request.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_deepseek_model")]
    pub deepseek_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_attempts: default_max_attempts(),
            history_turns: default_history_turns(),
            timeout_secs: default_completion_timeout_secs(),
            deepseek_model: default_deepseek_model(),
            anthropic_model: default_anthropic_model(),
            openai_model: default_openai_model(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_history_turns() -> usize {
    6
}
fn default_completion_timeout_secs() -> u64 {
    60
}
fn default_deepseek_model() -> String {
    "deepseek-chat".to_string()
}
fn default_anthropic_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// OCR HTTP endpoint. Unset disables the OCR fallback.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Rasterization scale factor for OCR legibility.
    #[serde(default = "default_ocr_scale")]
    pub scale: f32,
    /// Concurrent OCR requests. 1 keeps the provider-friendly sequential
    /// behavior; raise it to trade rate-limit safety for throughput.
    #[serde(default = "default_ocr_workers")]
    pub workers: usize,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            scale: default_ocr_scale(),
            workers: default_ocr_workers(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_ocr_scale() -> f32 {
    2.0
}
fn default_ocr_workers() -> usize {
    1
}
fn default_ocr_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    256
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

/// Plan caps and per-operation credit costs.
#[derive(Debug, Deserialize, Clone)]
pub struct PlansConfig {
    #[serde(default = "default_chat_cost")]
    pub chat_cost: i64,
    #[serde(default = "default_summary_cost")]
    pub summary_cost: i64,
    #[serde(default = "default_ocr_page_cost")]
    pub ocr_page_cost: i64,
    /// Daily operation cap for the free plan.
    #[serde(default = "default_free_daily_limit")]
    pub free_daily_limit: i64,
    /// Monthly operation cap for the basic plan.
    #[serde(default = "default_basic_monthly_limit")]
    pub basic_monthly_limit: i64,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            chat_cost: default_chat_cost(),
            summary_cost: default_summary_cost(),
            ocr_page_cost: default_ocr_page_cost(),
            free_daily_limit: default_free_daily_limit(),
            basic_monthly_limit: default_basic_monthly_limit(),
        }
    }
}

fn default_chat_cost() -> i64 {
    1
}
fn default_summary_cost() -> i64 {
    1
}
fn default_ocr_page_cost() -> i64 {
    1
}
fn default_free_daily_limit() -> i64 {
    10
}
fn default_basic_monthly_limit() -> i64 {
    100
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
    "127.0.0.1:8787".to_string()
}

impl Config {
    /// A config with all defaults and the given database path. Used by tests
    /// and by commands that can run without a config file.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            chunking: ChunkingConfig::default(),
            scan: ScanConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            completion: CompletionConfig::default(),
            ocr: OcrConfig::default(),
            cache: CacheConfig::default(),
            plans: PlansConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    // The sliding window does not advance otherwise.
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be < chunking.chunk_size");
    }

    if !(0.0..=1.0).contains(&config.scan.text_page_ratio) {
        anyhow::bail!("scan.text_page_ratio must be in [0.0, 1.0]");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.ocr.workers == 0 {
        anyhow::bail!("ocr.workers must be >= 1");
    }
    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be >= 1");
    }

    if config.plans.chat_cost < 0 || config.plans.summary_cost < 0 || config.plans.ocr_page_cost < 0
    {
        anyhow::bail!("plan costs must be >= 0");
    }

    Ok(())
}

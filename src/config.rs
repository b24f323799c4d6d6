use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for the content-addressed object store.
    pub root: PathBuf,
    /// Uploads larger than this are rejected with a validation error.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 3,
            timeout_secs: 15,
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
fn default_embed_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_answer_tokens")]
    pub max_answer_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            timeout_secs: 60,
            max_retries: 2,
            max_answer_tokens: 1024,
        }
    }
}

fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    2
}
fn default_max_answer_tokens() -> u32 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Chunks per embedding batch. Bounds peak memory and respects upstream
    /// rate limits.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    /// Concurrent document pipelines.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue depth before enqueue starts failing observably.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Lines repeated near the top/bottom of at least this fraction of pages
    /// are treated as boilerplate and stripped before embedding.
    #[serde(default = "default_boilerplate_threshold")]
    pub boilerplate_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 10,
            workers: 2,
            queue_capacity: 64,
            boilerplate_threshold: 0.7,
        }
    }
}

fn default_embed_batch_size() -> usize {
    10
}
fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}
fn default_boilerplate_threshold() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates fetched from the vector index before reranking.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Final number of chunks kept for context assembly.
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    /// Score penalty per page of distance from the anchor page.
    #[serde(default = "default_proximity_penalty")]
    pub proximity_penalty: f64,
    /// Upper bound on assembled context size in characters.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: 8,
            final_limit: 5,
            proximity_penalty: 0.05,
            max_context_chars: 12_000,
        }
    }
}

fn default_candidate_k() -> usize {
    8
}
fn default_final_limit() -> usize {
    5
}
fn default_proximity_penalty() -> f64 {
    0.05
}
fn default_max_context_chars() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TTL for deterministic single-question answers.
    #[serde(default = "default_answer_ttl")]
    pub answer_ttl_secs: i64,
    /// Shorter TTL for list-style questions.
    #[serde(default = "default_list_ttl")]
    pub list_ttl_secs: i64,
    /// Cost table keyed by model name, used for hit savings accounting.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            answer_ttl_secs: 86_400,
            list_ttl_secs: 600,
            pricing: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ModelPricing {
    /// USD per 1K input tokens.
    pub input_per_1k: f64,
    /// USD per 1K output tokens.
    pub output_per_1k: f64,
}

fn default_true() -> bool {
    true
}
fn default_answer_ttl() -> i64 {
    86_400
}
fn default_list_ttl() -> i64 {
    600
}

/// Per-role limits for one endpoint class. Roles absent from the map fall
/// back to the `basic` entry.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WindowLimit {
    pub limit: i64,
    pub window_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// (endpoint class → role → limit). Example:
    /// `[rate_limit.classes.query] basic = { limit = 100, window_secs = 900 }`
    #[serde(default)]
    pub classes: HashMap<String, HashMap<String, WindowLimit>>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut classes = HashMap::new();
        let mut query = HashMap::new();
        query.insert(
            "basic".to_string(),
            WindowLimit {
                limit: 100,
                window_secs: 900,
            },
        );
        query.insert(
            "elevated".to_string(),
            WindowLimit {
                limit: 300,
                window_secs: 900,
            },
        );
        query.insert(
            "institutional".to_string(),
            WindowLimit {
                limit: 1000,
                window_secs: 900,
            },
        );
        query.insert(
            "administrative".to_string(),
            WindowLimit {
                limit: 5000,
                window_secs: 900,
            },
        );
        classes.insert("query".to_string(), query);

        let mut upload = HashMap::new();
        upload.insert(
            "basic".to_string(),
            WindowLimit {
                limit: 20,
                window_secs: 3600,
            },
        );
        upload.insert(
            "elevated".to_string(),
            WindowLimit {
                limit: 60,
                window_secs: 3600,
            },
        );
        classes.insert("upload".to_string(), upload);

        Self {
            enabled: true,
            classes,
        }
    }
}

impl RateLimitConfig {
    pub fn lookup(&self, endpoint_class: &str, role: &str) -> Option<WindowLimit> {
        let by_role = self.classes.get(endpoint_class)?;
        by_role.get(role).or_else(|| by_role.get("basic")).copied()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    /// Max documents per owner, keyed by role. `-1` means unlimited.
    #[serde(default)]
    pub max_documents: HashMap<String, i64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut max_documents = HashMap::new();
        max_documents.insert("basic".to_string(), 10);
        max_documents.insert("elevated".to_string(), 100);
        max_documents.insert("institutional".to_string(), 1000);
        max_documents.insert("administrative".to_string(), -1);
        Self { max_documents }
    }
}

impl QuotaConfig {
    /// Resolves the document limit for a role; `i64::MAX` means unlimited.
    pub fn document_limit(&self, role: &str) -> i64 {
        let raw = self
            .max_documents
            .get(role)
            .or_else(|| self.max_documents.get("basic"))
            .copied()
            .unwrap_or(10);
        if raw < 0 {
            i64::MAX
        } else {
            raw
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.embed_batch_size == 0 {
        anyhow::bail!("pipeline.embed_batch_size must be > 0");
    }
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }
    if !(0.0..=1.0).contains(&config.pipeline.boilerplate_threshold) {
        anyhow::bail!("pipeline.boilerplate_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.final_limit == 0 || config.retrieval.candidate_k == 0 {
        anyhow::bail!("retrieval.candidate_k and retrieval.final_limit must be >= 1");
    }
    if config.retrieval.final_limit > config.retrieval.candidate_k {
        anyhow::bail!("retrieval.final_limit must not exceed retrieval.candidate_k");
    }
    if config.retrieval.proximity_penalty < 0.0 {
        anyhow::bail!("retrieval.proximity_penalty must be >= 0");
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
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.llm.provider != "disabled" && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    match config.llm.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_role_fallback() {
        let rl = RateLimitConfig::default();
        // Unknown role falls back to basic
        let w = rl.lookup("query", "guest").unwrap();
        assert_eq!(w.limit, 100);
        // Known role resolves directly
        let w = rl.lookup("query", "institutional").unwrap();
        assert_eq!(w.limit, 1000);
        // Unknown endpoint class has no entry
        assert!(rl.lookup("export", "basic").is_none());
    }

    #[test]
    fn test_quota_unlimited_maps_to_sentinel() {
        let q = QuotaConfig::default();
        assert_eq!(q.document_limit("administrative"), i64::MAX);
        assert_eq!(q.document_limit("basic"), 10);
        assert_eq!(q.document_limit("nobody"), 10);
    }
}

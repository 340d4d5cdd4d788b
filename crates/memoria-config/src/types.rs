//! Configuration types.
//!
//! Every section rejects unknown keys so a typo fails at startup instead of
//! silently falling back to a default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Hard ceiling for link traversal depth.
pub const MAX_TRAVERSAL_DEPTH: usize = 3;

/// Largest embedding dimension accepted by the vector index.
pub const MAX_EMBEDDING_DIMENSIONS: usize = 8192;

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration for the memory engine.
///
/// ```toml
/// [storage]
/// data_dir = "/var/lib/memoria"
///
/// [embedding]
/// dimensions = 1536
///
/// [[embedding.providers]]
/// kind = "openai"
/// model = "text-embedding-3-small"
/// api_key_env = "OPENAI_API_KEY"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoriaConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub completion: CompletionConfig,
    pub decay: DecayConfig,
    pub search: SearchConfig,
    pub graph: GraphConfig,
    pub consolidation: ConsolidationConfig,
    pub wal: WalConfig,
    pub logging: LoggingConfig,
}

impl MemoriaConfig {
    /// Create a configuration with every default applied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value for range and consistency.
    ///
    /// Called once at load time; the engine calls it again on open so a
    /// programmatically built config cannot bypass it.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.embedding.validate()?;
        self.completion.validate()?;
        self.decay.validate()?;
        self.search.validate()?;
        self.graph.validate()?;
        self.consolidation.validate()?;
        self.wal.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Names of provider entries that carry a literal API key.
    pub fn plaintext_key_sections(&self) -> Vec<String> {
        let mut sections = Vec::new();
        for (i, p) in self.embedding.providers.iter().enumerate() {
            if p.has_plaintext_api_key() {
                sections.push(format!("embedding.providers[{}]", i));
            }
        }
        for (i, p) in self.completion.providers.iter().enumerate() {
            if p.has_plaintext_api_key() {
                sections.push(format!("completion.providers[{}]", i));
            }
        }
        sections
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(field: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        return Err(ConfigError::invalid(
            field,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(())
}

fn check_unit(field: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(field, format!("{} is not within 0.0..=1.0", value)));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

/// Where and how facts are persisted.
///
/// ```toml
/// [storage]
/// data_dir = "~/.local/share/memoria"
/// max_text_length = 4000
/// read_connections = 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding the fact store, vector index and WAL.
    /// Falls back to `MEMORIA_DATA_DIR`, then the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Maximum fact text length in characters.
    pub max_text_length: usize,
    /// Extra read-only connections for concurrent lookups and searches.
    pub read_connections: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_text_length: 4000,
            read_connections: 4,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        check_range("storage.max_text_length", self.max_text_length, 1, 1_000_000)?;
        check_range("storage.read_connections", self.read_connections, 0, 64)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

/// Provider implementation to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible HTTP endpoint.
    Openai,
    /// Deterministic in-process provider for tests and offline use.
    Mock,
}

/// One entry in an ordered provider fallback list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderEntry {
    pub kind: ProviderKind,
    /// Model name sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Base URL override (e.g. a local OpenAI-compatible server).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Literal API key (prefer `api_key_env`; warns if set here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderEntry {
    pub fn mock() -> Self {
        Self {
            kind: ProviderKind::Mock,
            model: None,
            base_url: None,
            api_key: None,
            api_key_env: None,
        }
    }

    pub fn has_plaintext_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Resolve the API key: literal value first, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }

    fn validate(&self, field: &str) -> Result<()> {
        if let Some(url) = &self.base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(ConfigError::invalid(
                &format!("{}.base_url", field),
                format!("'{}' is not an http(s) URL", url),
            ));
        }
        Ok(())
    }
}

/// Embedding provider configuration.
///
/// All providers in the list must produce vectors of `dimensions` length;
/// the list is tried in order until one succeeds.
///
/// ```toml
/// [embedding]
/// dimensions = 1536
/// timeout_secs = 30
///
/// [[embedding.providers]]
/// kind = "openai"
/// model = "text-embedding-3-small"
/// api_key_env = "OPENAI_API_KEY"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub dimensions: usize,
    pub timeout_secs: u64,
    pub providers: Vec<ProviderEntry>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: 384,
            timeout_secs: 30,
            providers: Vec::new(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        check_range("embedding.dimensions", self.dimensions, 1, MAX_EMBEDDING_DIMENSIONS)?;
        check_range("embedding.timeout_secs", self.timeout_secs, 1, 600)?;
        for (i, p) in self.providers.iter().enumerate() {
            p.validate(&format!("embedding.providers[{}]", i))?;
        }
        Ok(())
    }
}

/// Completion provider configuration (classification, summarization,
/// query rewriting).
///
/// ```toml
/// [completion]
/// classify = true
/// rewrite_queries = false
///
/// [[completion.providers]]
/// kind = "openai"
/// model = "gpt-4o-mini"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionConfig {
    pub timeout_secs: u64,
    /// Ask the completion provider to categorize facts stored without one.
    pub classify: bool,
    /// Rewrite search queries into hypothetical answers before embedding.
    pub rewrite_queries: bool,
    pub providers: Vec<ProviderEntry>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            classify: false,
            rewrite_queries: false,
            providers: Vec::new(),
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        check_range("completion.timeout_secs", self.timeout_secs, 1, 600)?;
        for (i, p) in self.providers.iter().enumerate() {
            p.validate(&format!("completion.providers[{}]", i))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decay
// ─────────────────────────────────────────────────────────────────────────────

/// Time-to-live per decay class and sweep cadence.
///
/// Permanent facts never expire and have no setting.
///
/// ```toml
/// [decay]
/// stable_ttl_days = 90
/// active_ttl_days = 14
/// session_ttl_hours = 24
/// checkpoint_ttl_hours = 4
/// soft_decay_threshold = 0.75
/// min_confidence = 0.1
/// sweep_interval_secs = 3600
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecayConfig {
    pub stable_ttl_days: u64,
    pub active_ttl_days: u64,
    pub session_ttl_hours: u64,
    pub checkpoint_ttl_hours: u64,
    /// Fraction of the TTL after which confidence starts to fall.
    pub soft_decay_threshold: f32,
    /// Confidence a fact reaches at the moment it expires.
    pub min_confidence: f32,
    pub sweep_interval_secs: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            stable_ttl_days: 90,
            active_ttl_days: 14,
            session_ttl_hours: 24,
            checkpoint_ttl_hours: 4,
            soft_decay_threshold: 0.75,
            min_confidence: 0.1,
            sweep_interval_secs: 3600,
        }
    }
}

impl DecayConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        check_range("decay.stable_ttl_days", self.stable_ttl_days, 1, 36_500)?;
        check_range("decay.active_ttl_days", self.active_ttl_days, 1, 36_500)?;
        check_range("decay.session_ttl_hours", self.session_ttl_hours, 1, 8_760)?;
        check_range("decay.checkpoint_ttl_hours", self.checkpoint_ttl_hours, 1, 8_760)?;
        check_unit("decay.soft_decay_threshold", self.soft_decay_threshold)?;
        if self.soft_decay_threshold >= 1.0 {
            return Err(ConfigError::invalid(
                "decay.soft_decay_threshold",
                "must be below 1.0",
            ));
        }
        check_unit("decay.min_confidence", self.min_confidence)?;
        check_range("decay.sweep_interval_secs", self.sweep_interval_secs, 1, 604_800)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────────────────────────────────────

/// Hybrid search tuning.
///
/// ```toml
/// [search]
/// rrf_k = 60
/// default_limit = 10
/// candidate_multiplier = 4
/// min_similarity = 0.25
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Reciprocal Rank Fusion constant.
    pub rrf_k: u32,
    pub default_limit: usize,
    /// Each backend is asked for `limit * candidate_multiplier` candidates
    /// so post-filtering still leaves enough results.
    pub candidate_multiplier: usize,
    /// Vector hits below this cosine similarity are dropped.
    pub min_similarity: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            default_limit: 10,
            candidate_multiplier: 4,
            min_similarity: 0.25,
        }
    }
}

impl SearchConfig {
    fn validate(&self) -> Result<()> {
        check_range("search.rrf_k", self.rrf_k, 1, 10_000)?;
        check_range("search.default_limit", self.default_limit, 1, 1_000)?;
        check_range("search.candidate_multiplier", self.candidate_multiplier, 1, 50)?;
        check_unit("search.min_similarity", self.min_similarity)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph
// ─────────────────────────────────────────────────────────────────────────────

/// Link graph traversal and auto-linking.
///
/// ```toml
/// [graph]
/// default_depth = 2
/// max_depth = 3
/// auto_link = true
/// auto_link_top_n = 5
/// auto_link_min_similarity = 0.8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    pub default_depth: usize,
    pub max_depth: usize,
    /// Create `RelatedTo` links to similar facts at store time.
    pub auto_link: bool,
    pub auto_link_top_n: usize,
    pub auto_link_min_similarity: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_depth: 2,
            max_depth: MAX_TRAVERSAL_DEPTH,
            auto_link: false,
            auto_link_top_n: 5,
            auto_link_min_similarity: 0.8,
        }
    }
}

impl GraphConfig {
    fn validate(&self) -> Result<()> {
        check_range("graph.max_depth", self.max_depth, 1, MAX_TRAVERSAL_DEPTH)?;
        check_range("graph.default_depth", self.default_depth, 1, self.max_depth)?;
        check_range("graph.auto_link_top_n", self.auto_link_top_n, 1, 100)?;
        check_unit("graph.auto_link_min_similarity", self.auto_link_min_similarity)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consolidation
// ─────────────────────────────────────────────────────────────────────────────

/// Near-duplicate clustering and merging.
///
/// ```toml
/// [consolidation]
/// threshold = 0.92
/// include_identifiers = false
/// neighbor_limit = 10
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsolidationConfig {
    /// Cosine similarity at or above which two facts are duplicates.
    pub threshold: f32,
    /// Also merge facts that look like IPs, emails, UUIDs or keys.
    pub include_identifiers: bool,
    /// Nearest neighbours inspected per fact.
    pub neighbor_limit: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.92,
            include_identifiers: false,
            neighbor_limit: 10,
        }
    }
}

impl ConsolidationConfig {
    fn validate(&self) -> Result<()> {
        check_unit("consolidation.threshold", self.threshold)?;
        if self.threshold <= 0.0 {
            return Err(ConfigError::invalid("consolidation.threshold", "must be above 0.0"));
        }
        check_range("consolidation.neighbor_limit", self.neighbor_limit, 1, 1_000)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WAL
// ─────────────────────────────────────────────────────────────────────────────

/// Write-ahead log retention.
///
/// ```toml
/// [wal]
/// max_age_secs = 86400
/// compact_interval_secs = 600
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalConfig {
    /// Pending entries older than this are discarded at recovery.
    pub max_age_secs: u64,
    pub compact_interval_secs: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 86_400,
            compact_interval_secs: 600,
        }
    }
}

impl WalConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        check_range("wal.max_age_secs", self.max_age_secs, 60, 31_536_000)?;
        check_range("wal.compact_interval_secs", self.compact_interval_secs, 1, 86_400)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Log output settings for the CLI.
///
/// ```toml
/// [logging]
/// level = "info"
/// file = true
/// dir = "/var/log/memoria"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// Write JSON logs to a daily rolling file.
    pub file: bool,
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
            dir: None,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("'{}' is not one of {}", self.level, LEVELS.join(", ")),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! TOML configuration.
//!
//! Every section has defaults, so an empty file is a valid configuration
//! that serves the built-in partitions with embeddings and generation
//! disabled. API keys are never stored here; sections name the environment
//! variable to read instead (`api_key_env`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use knowledge_relay_core::partition::{PartitionDef, PartitionRegistry};
use knowledge_relay_core::ranking::ScoringPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

// ============ [server] ============

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

// ============ [retrieval] ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_freshness_weight")]
    pub freshness_weight: f64,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_budget_tokens")]
    pub default_budget_tokens: usize,
    #[serde(default = "default_max_budget_tokens")]
    pub max_budget_tokens: usize,
    #[serde(default = "default_max_ingest_chars")]
    pub max_ingest_chars: usize,
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
    #[serde(default = "default_index_timeout_ms")]
    pub index_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            freshness_weight: default_freshness_weight(),
            score_threshold: default_score_threshold(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            default_budget_tokens: default_budget_tokens(),
            max_budget_tokens: default_max_budget_tokens(),
            max_ingest_chars: default_max_ingest_chars(),
            embed_timeout_ms: default_embed_timeout_ms(),
            index_timeout_ms: default_index_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn policy(&self) -> ScoringPolicy {
        ScoringPolicy {
            similarity_weight: self.similarity_weight,
            freshness_weight: self.freshness_weight,
            score_threshold: self.score_threshold,
            default_top_k: self.default_top_k,
            max_top_k: self.max_top_k,
        }
    }
}

fn default_similarity_weight() -> f64 {
    0.8
}
fn default_freshness_weight() -> f64 {
    0.2
}
fn default_score_threshold() -> f64 {
    0.65
}
fn default_top_k() -> usize {
    5
}
fn default_max_top_k() -> usize {
    20
}
fn default_budget_tokens() -> usize {
    2000
}
fn default_max_budget_tokens() -> usize {
    8000
}
fn default_max_ingest_chars() -> usize {
    knowledge_relay_core::privacy::MAX_CHUNK_CHARS
}
fn default_embed_timeout_ms() -> u64 {
    5000
}
fn default_index_timeout_ms() -> u64 {
    5000
}

// ============ [embedding] ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Override for the embeddings endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            api_key_env: None,
            max_retries: default_max_retries(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_http_timeout_secs() -> u64 {
    30
}

// ============ [index] ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `memory` or `rest`.
    #[serde(default = "default_index_provider")]
    pub provider: String,
    /// Base URL per index key, for the `rest` provider.
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    #[serde(default = "default_index_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_index_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            hosts: HashMap::new(),
            api_key_env: default_index_key_env(),
            timeout_secs: default_index_http_timeout_secs(),
        }
    }
}

fn default_index_provider() -> String {
    "memory".to_string()
}
fn default_index_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}
fn default_index_http_timeout_secs() -> u64 {
    10
}

// ============ [generation] ============

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `anthropic`, or `openai`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_tokens_cap")]
    pub max_tokens_cap: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            api_key_env: None,
            max_tokens: default_max_tokens(),
            max_tokens_cap: default_max_tokens_cap(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_max_tokens_cap() -> u32 {
    8192
}
fn default_generation_timeout_secs() -> u64 {
    120
}

// ============ [stream] ============

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

impl StreamConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn heartbeat_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

fn default_session_ttl_secs() -> u64 {
    90
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_max_duration_secs() -> u64 {
    85
}

// ============ [research] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ResearchConfig {
    #[serde(default = "default_section_timeout_secs")]
    pub section_timeout_secs: u64,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub synthesis_timeout_secs: u64,
    #[serde(default = "default_synthesis_max_tokens")]
    pub synthesis_max_tokens: u32,
    #[serde(default)]
    pub sections: BTreeMap<String, SectionConfig>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            section_timeout_secs: default_section_timeout_secs(),
            synthesis_timeout_secs: default_synthesis_timeout_secs(),
            synthesis_max_tokens: default_synthesis_max_tokens(),
            sections: BTreeMap::new(),
        }
    }
}

/// How one research section is looked up.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionConfig {
    /// `GET` a URL; `{subject_id}` in the template is replaced.
    Http {
        url: String,
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_api_key_header")]
        api_key_header: String,
    },
    /// Ask the generation backend; `{subject_id}` and `{display_name}` are
    /// replaced in the template. The reply must contain a JSON object.
    Prompt {
        prompt: String,
        #[serde(default = "default_prompt_max_tokens")]
        max_tokens: u32,
    },
}

fn default_section_timeout_secs() -> u64 {
    15
}
fn default_synthesis_timeout_secs() -> u64 {
    10
}
fn default_synthesis_max_tokens() -> u32 {
    512
}
fn default_api_key_header() -> String {
    "Authorization".to_string()
}
fn default_prompt_max_tokens() -> u32 {
    800
}

// ============ [turn] ============

#[derive(Debug, Deserialize, Clone)]
pub struct TurnConfig {
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    60
}

// ============ [intent] ============

/// Intent classification for turns that retrieve without naming
/// partitions.
#[derive(Debug, Deserialize, Clone)]
pub struct IntentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Model override for classification calls; the generation model
    /// otherwise.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_intent_timeout_ms")]
    pub timeout_ms: u64,
    /// Below this confidence the role's default partitions are used.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_intent_max_tokens")]
    pub max_tokens: u32,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            timeout_ms: default_intent_timeout_ms(),
            min_confidence: default_min_confidence(),
            max_tokens: default_intent_max_tokens(),
        }
    }
}

impl IntentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_intent_timeout_ms() -> u64 {
    3000
}
fn default_min_confidence() -> f64 {
    0.5
}
fn default_intent_max_tokens() -> u32 {
    300
}

// ============ [partitions.<id>] / [roles.<role>] ============

#[derive(Debug, Deserialize, Clone)]
pub struct PartitionConfig {
    pub index: String,
    #[serde(default)]
    pub label: Option<String>,
    pub allowed_roles: Vec<String>,
    pub ttl_hours: f64,
    #[serde(default)]
    pub required_metadata: Vec<String>,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    #[serde(default)]
    pub identity_field: Option<String>,
    #[serde(default)]
    pub access_note: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RoleConfig {
    #[serde(default)]
    pub default_partitions: Vec<String>,
}

impl Config {
    /// Build the partition registry.
    ///
    /// With no `[partitions]` the built-in set is used; its role defaults
    /// apply unless `[roles]` overrides them.
    pub fn registry(&self) -> Result<PartitionRegistry> {
        let builtin = PartitionRegistry::builtin();

        let defs: Vec<PartitionDef> = if self.partitions.is_empty() {
            builtin.partitions().cloned().collect()
        } else {
            self.partitions
                .iter()
                .map(|(id, p)| PartitionDef {
                    id: id.clone(),
                    index: p.index.clone(),
                    label: p.label.clone().unwrap_or_else(|| id.clone()),
                    allowed_roles: p.allowed_roles.iter().cloned().collect(),
                    ttl_hours: p.ttl_hours,
                    required_metadata: p.required_metadata.clone(),
                    timestamp_field: p.timestamp_field.clone(),
                    identity_field: p.identity_field.clone(),
                    access_note: p.access_note.clone(),
                })
                .collect()
        };

        let role_defaults = if !self.roles.is_empty() {
            self.roles
                .iter()
                .map(|(role, r)| (role.clone(), r.default_partitions.clone()))
                .collect()
        } else if self.partitions.is_empty() {
            builtin.role_defaults().clone()
        } else {
            HashMap::new()
        };

        PartitionRegistry::new(defs, role_defaults)
    }
}

/// Read, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let r = &config.retrieval;
    for (name, v) in [
        ("similarity_weight", r.similarity_weight),
        ("freshness_weight", r.freshness_weight),
        ("score_threshold", r.score_threshold),
    ] {
        if !(0.0..=1.0).contains(&v) {
            bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if r.max_top_k == 0 {
        bail!("retrieval.max_top_k must be >= 1");
    }
    if r.default_top_k == 0 || r.default_top_k > r.max_top_k {
        bail!("retrieval.default_top_k must be in [1, max_top_k]");
    }
    if r.default_budget_tokens == 0 || r.default_budget_tokens > r.max_budget_tokens {
        bail!("retrieval.default_budget_tokens must be in [1, max_budget_tokens]");
    }
    if r.max_ingest_chars == 0 {
        bail!("retrieval.max_ingest_chars must be > 0");
    }
    if r.embed_timeout_ms == 0 || r.index_timeout_ms == 0 {
        bail!("retrieval timeouts must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "voyage" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or voyage.",
            other
        ),
    }

    let registry = config.registry().context("Invalid partition configuration")?;

    match config.index.provider.as_str() {
        "memory" => {}
        "rest" => {
            for p in registry.partitions() {
                if !config.index.hosts.contains_key(&p.index) {
                    bail!(
                        "index.hosts has no entry for index '{}' (partition '{}')",
                        p.index,
                        p.id
                    );
                }
            }
        }
        other => bail!("Unknown index provider: '{}'. Must be memory or rest.", other),
    }

    let g = &config.generation;
    match g.provider.as_str() {
        "disabled" => {}
        "anthropic" | "openai" => {
            if g.model.is_none() {
                bail!("generation.model must be specified when provider is '{}'", g.provider);
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, anthropic, or openai.",
            other
        ),
    }
    if g.max_tokens == 0 || g.max_tokens > g.max_tokens_cap {
        bail!("generation.max_tokens must be in [1, max_tokens_cap]");
    }

    let s = &config.stream;
    if s.session_ttl_secs == 0 || s.poll_interval_ms == 0 || s.heartbeat_secs == 0 {
        bail!("stream intervals must be > 0");
    }
    if s.max_duration_secs == 0 {
        bail!("stream.max_duration_secs must be > 0");
    }

    if config.research.section_timeout_secs == 0 || config.research.synthesis_timeout_secs == 0 {
        bail!("research timeouts must be > 0");
    }
    for (name, section) in &config.research.sections {
        match section {
            SectionConfig::Http { url, .. } if url.trim().is_empty() => {
                bail!("research.sections.{}: url must not be empty", name)
            }
            SectionConfig::Prompt { prompt, .. } if prompt.trim().is_empty() => {
                bail!("research.sections.{}: prompt must not be empty", name)
            }
            _ => {}
        }
    }

    if config.turn.deadline_secs == 0 {
        bail!("turn.deadline_secs must be > 0");
    }

    let i = &config.intent;
    if i.timeout_ms == 0 || i.max_tokens == 0 {
        bail!("intent.timeout_ms and intent.max_tokens must be > 0");
    }
    if !(0.0..=1.0).contains(&i.min_confidence) {
        bail!("intent.min_confidence must be in [0, 1]");
    }

    Ok(())
}

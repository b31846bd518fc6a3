//! TOML configuration parsing and validation.
//!
//! Every tunable of the engine lives here: debounce windows, latency
//! bounds per priority class, worker pool sizing, retry budgets and the
//! quality thresholds that decide rollbacks. Sections other than `[db]`
//! have defaults, so a minimal file only names the database path.
//!
//! ```toml
//! [db]
//! path = "./data/kbsync.sqlite"
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//!
//! [sources.filesystem.docs]
//! root = "./docs"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{Impact, PriorityClass, SourceType};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
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
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

/// A value per priority class.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PerClass<T> {
    pub critical: T,
    pub high: T,
    pub medium: T,
    pub low: T,
}

impl<T: Copy> PerClass<T> {
    pub fn get(&self, class: PriorityClass) -> T {
        match class {
            PriorityClass::Critical => self.critical,
            PriorityClass::High => self.high,
            PriorityClass::Medium => self.medium,
            PriorityClass::Low => self.low,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Quiet period per provisional class before an observation is emitted.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: PerClass<u64>,
    #[serde(default = "default_read_max_retries")]
    pub read_max_retries: u32,
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
    #[serde(default = "default_read_backoff_cap_ms")]
    pub read_backoff_cap_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            read_max_retries: default_read_max_retries(),
            read_backoff_ms: default_read_backoff_ms(),
            read_backoff_cap_ms: default_read_backoff_cap_ms(),
        }
    }
}

impl DetectorConfig {
    pub fn debounce(&self, class: PriorityClass) -> Duration {
        Duration::from_millis(self.debounce_ms.get(class))
    }
}

fn default_debounce_ms() -> PerClass<u64> {
    PerClass {
        critical: 0,
        high: 2_000,
        medium: 5_000,
        low: 30_000,
    }
}
fn default_read_max_retries() -> u32 {
    4
}
fn default_read_backoff_ms() -> u64 {
    250
}
fn default_read_backoff_cap_ms() -> u64 {
    8_000
}

/// What `enqueue` does when the update queue is at capacity.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    Block,
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_full_policy")]
    pub full_policy: FullPolicy,
    /// Maximum acceptable latency per class, in seconds.
    #[serde(default = "default_latency_secs")]
    pub latency_secs: PerClass<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            full_policy: default_full_policy(),
            latency_secs: default_latency_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn latency_bound(&self, class: PriorityClass) -> Duration {
        Duration::from_secs(self.latency_secs.get(class))
    }
}

fn default_capacity() -> usize {
    10_000
}
fn default_full_policy() -> FullPolicy {
    FullPolicy::Block
}
fn default_latency_secs() -> PerClass<u64> {
    PerClass {
        critical: 0,
        high: 300,
        medium: 3_600,
        low: 86_400,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// Changed-chunk fraction at which impact becomes medium.
    #[serde(default = "default_medium_fraction")]
    pub medium_fraction: f64,
    /// Changed-chunk fraction at which impact becomes high.
    #[serde(default = "default_high_fraction")]
    pub high_fraction: f64,
    /// Changed text containing any of these escalates impact to high.
    #[serde(default = "default_escalation_keywords")]
    pub escalation_keywords: Vec<String>,
    #[serde(default = "default_escalation_categories")]
    pub escalation_categories: Vec<String>,
    #[serde(default)]
    pub critical_categories: Vec<String>,
    #[serde(default)]
    pub high_categories: Vec<String>,
    /// Impact forced on first observation, per source type.
    #[serde(default)]
    pub insert_impact: InsertImpact,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct InsertImpact {
    #[serde(default = "default_file_insert")]
    pub file: Impact,
    #[serde(default = "default_database_row_insert")]
    pub database_row: Impact,
    #[serde(default = "default_api_feed_insert")]
    pub api_feed: Impact,
}

impl Default for InsertImpact {
    fn default() -> Self {
        Self {
            file: default_file_insert(),
            database_row: default_database_row_insert(),
            api_feed: default_api_feed_insert(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            medium_fraction: default_medium_fraction(),
            high_fraction: default_high_fraction(),
            escalation_keywords: default_escalation_keywords(),
            escalation_categories: default_escalation_categories(),
            critical_categories: Vec::new(),
            high_categories: Vec::new(),
            insert_impact: InsertImpact::default(),
        }
    }
}

impl ClassifierConfig {
    pub fn insert_impact_for(&self, source_type: SourceType) -> Impact {
        match source_type {
            SourceType::File => self.insert_impact.file,
            SourceType::DatabaseRow => self.insert_impact.database_row,
            SourceType::ApiFeed => self.insert_impact.api_feed,
        }
    }
}

fn default_medium_fraction() -> f64 {
    0.25
}
fn default_high_fraction() -> f64 {
    0.6
}
fn default_escalation_keywords() -> Vec<String> {
    ["compliance", "gdpr", "hipaa", "legal hold"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_escalation_categories() -> Vec<String> {
    vec!["compliance".to_string()]
}
fn default_file_insert() -> Impact {
    Impact::Medium
}
fn default_database_row_insert() -> Impact {
    Impact::High
}
fn default_api_feed_insert() -> Impact {
    Impact::Medium
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long a worker keeps collecting events after the first one.
    #[serde(default = "default_collect_timeout_ms")]
    pub collect_timeout_ms: u64,
    #[serde(default = "default_embed_max_retries")]
    pub embed_max_retries: u32,
    #[serde(default = "default_embed_backoff_ms")]
    pub embed_backoff_ms: u64,
    #[serde(default = "default_embed_backoff_cap_ms")]
    pub embed_backoff_cap_ms: u64,
    /// Retries of a whole batch when staging fails.
    #[serde(default = "default_batch_max_retries")]
    pub batch_max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_batch_size: default_max_batch_size(),
            collect_timeout_ms: default_collect_timeout_ms(),
            embed_max_retries: default_embed_max_retries(),
            embed_backoff_ms: default_embed_backoff_ms(),
            embed_backoff_cap_ms: default_embed_backoff_cap_ms(),
            batch_max_retries: default_batch_max_retries(),
        }
    }
}

impl WorkerConfig {
    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.collect_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    4
}
fn default_max_batch_size() -> usize {
    16
}
fn default_collect_timeout_ms() -> u64 {
    200
}
fn default_embed_max_retries() -> u32 {
    5
}
fn default_embed_backoff_ms() -> u64 {
    1_000
}
fn default_embed_backoff_cap_ms() -> u64 {
    32_000
}
fn default_batch_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Mean top-K overlap below this triggers a rollback.
    #[serde(default = "default_min_overlap")]
    pub min_overlap: f64,
    /// Mean drop of canary relevance scores above this triggers a rollback.
    #[serde(default = "default_max_score_drop")]
    pub max_score_drop: f64,
    #[serde(default = "default_canary_sample_size")]
    pub canary_sample_size: usize,
    #[serde(default)]
    pub pinned_canaries: Vec<String>,
    /// Rollbacks tolerated per document before its work is dead-lettered.
    #[serde(default = "default_max_rollbacks")]
    pub max_rollbacks_per_document: u32,
    /// Generations kept in memory for rollback.
    #[serde(default = "default_generation_history")]
    pub generation_history: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_overlap: default_min_overlap(),
            max_score_drop: default_max_score_drop(),
            canary_sample_size: default_canary_sample_size(),
            pinned_canaries: Vec::new(),
            max_rollbacks_per_document: default_max_rollbacks(),
            generation_history: default_generation_history(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_overlap() -> f64 {
    0.3
}
fn default_max_score_drop() -> f64 {
    0.15
}
fn default_canary_sample_size() -> usize {
    20
}
fn default_max_rollbacks() -> u32 {
    1
}
fn default_generation_history() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_source_type() -> SourceType {
    SourceType::File
}

impl Config {
    /// Config with defaults everywhere and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            detector: DetectorConfig::default(),
            scheduler: SchedulerConfig::default(),
            classifier: ClassifierConfig::default(),
            workers: WorkerConfig::default(),
            quality: QualityConfig::default(),
            sources: SourcesConfig::default(),
        }
    }

    /// Check cross-field constraints. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "hash" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.provider != "hash" && self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        if self.scheduler.capacity == 0 {
            bail!("scheduler.capacity must be > 0");
        }
        let lat = &self.scheduler.latency_secs;
        if !(lat.critical <= lat.high && lat.high <= lat.medium && lat.medium <= lat.low) {
            bail!("scheduler.latency_secs must be non-decreasing from critical to low");
        }

        let c = &self.classifier;
        if !(0.0..=1.0).contains(&c.medium_fraction) || !(0.0..=1.0).contains(&c.high_fraction) {
            bail!("classifier fractions must be in [0.0, 1.0]");
        }
        if c.medium_fraction > c.high_fraction {
            bail!("classifier.medium_fraction must be <= classifier.high_fraction");
        }

        if self.workers.pool_size == 0 {
            bail!("workers.pool_size must be > 0");
        }
        if self.workers.max_batch_size == 0 {
            bail!("workers.max_batch_size must be > 0");
        }

        let q = &self.quality;
        if q.top_k == 0 {
            bail!("quality.top_k must be > 0");
        }
        if !(0.0..=1.0).contains(&q.min_overlap) {
            bail!("quality.min_overlap must be in [0.0, 1.0]");
        }
        if q.max_score_drop < 0.0 {
            bail!("quality.max_score_drop must be >= 0.0");
        }
        if q.generation_history < 2 {
            bail!("quality.generation_history must be >= 2 to allow rollback");
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

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/kb.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 700);
        assert_eq!(config.scheduler.full_policy, FullPolicy::Block);
        assert_eq!(
            config.scheduler.latency_bound(PriorityClass::High),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.classifier.insert_impact_for(SourceType::DatabaseRow),
            Impact::High
        );
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn parses_sources_and_overrides() {
        let config = parse(
            r#"
[db]
path = "/tmp/kb.sqlite"

[embedding]
provider = "hash"
dims = 64

[scheduler]
capacity = 8
full_policy = "reject"

[scheduler.latency_secs]
critical = 0
high = 10
medium = 20
low = 30

[classifier.insert_impact]
file = "low"

[sources.filesystem.docs]
root = "/srv/docs"
category = "runbook"
source_type = "api_feed"
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.full_policy, FullPolicy::Reject);
        assert_eq!(config.scheduler.latency_secs.low, 30);
        assert_eq!(
            config.classifier.insert_impact_for(SourceType::File),
            Impact::Low
        );
        let docs = &config.sources.filesystem["docs"];
        assert_eq!(docs.source_type, SourceType::ApiFeed);
        assert_eq!(docs.category.as_deref(), Some("runbook"));
        assert_eq!(docs.include_globs.len(), 2);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn rejects_decreasing_latency_bounds() {
        let err = parse(
            "[db]\npath = \"x\"\n[scheduler.latency_secs]\ncritical = 0\nhigh = 100\nmedium = 50\nlow = 200\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-decreasing"));
    }

    #[test]
    fn openai_requires_model() {
        let err =
            parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\ndims = 8\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }
}

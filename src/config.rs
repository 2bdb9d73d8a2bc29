//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal config is just:
//!
//! ```toml
//! [db]
//! path = "./data/catalog.sqlite"
//! ```
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[db]` | SQLite path and pool size |
//! | `[harvest]` | retry policy, attempt timeout, claim staleness, fan-out |
//! | `[http]` | adapter HTTP timeout, inner retries, rate limit |
//! | `[sources]` | API base URLs and the GitHub token |
//! | `[analysis]` | source file selection for the risk analyzer |
//! | `[scheduler]` | job cadences and maintenance ages |
//! | `[[seeds]]` | URLs harvested by the daily content job |
//! | `[logging]` | default log filter |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::Deserialize;

use crate::models::HostType;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub seeds: Vec<SeedConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Config with every section defaulted, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                max_connections: default_max_connections(),
            },
            harvest: HarvestConfig::default(),
            http: HttpConfig::default(),
            sources: SourcesConfig::default(),
            analysis: AnalysisConfig::default(),
            scheduler: SchedulerConfig::default(),
            seeds: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

// ═══════════════════════════════════════════════════════════════════════
// Harvesting
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Deadline for one fetch → parse → store attempt.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// A `processing` claim older than this is considered abandoned.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    /// Concurrent harvests in bulk sweeps.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            fan_out: default_fan_out(),
        }
    }
}

impl HarvestConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.initial_backoff_secs),
            Duration::from_secs(self.max_backoff_secs),
        )
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn stale_claim(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_secs() -> u64 {
    2
}
fn default_max_backoff_secs() -> u64 {
    30
}
fn default_attempt_timeout_secs() -> u64 {
    120
}
fn default_stale_claim_secs() -> u64 {
    600
}
fn default_fan_out() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    /// Inner retries for 429/5xx/network errors, on top of the first request.
    #[serde(default = "default_http_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Minimum spacing between two requests of one adapter.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            max_retries: default_http_max_retries(),
            initial_backoff_ms: default_http_initial_backoff_ms(),
            min_interval_ms: default_min_interval_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries + 1,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_secs(8),
        )
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}
fn default_http_max_retries() -> u32 {
    2
}
fn default_http_initial_backoff_ms() -> u64 {
    1000
}
fn default_min_interval_ms() -> u64 {
    250
}
fn default_user_agent() -> String {
    format!("catalog-harvester/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    /// Falls back to the `GITHUB_TOKEN` environment variable.
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default = "default_github_api")]
    pub github_api: String,
    #[serde(default = "default_npm_registry")]
    pub npm_registry: String,
    #[serde(default = "default_pypi_api")]
    pub pypi_api: String,
    #[serde(default = "default_docker_hub_api")]
    pub docker_hub_api: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            github_api: default_github_api(),
            npm_registry: default_npm_registry(),
            pypi_api: default_pypi_api(),
            docker_hub_api: default_docker_hub_api(),
        }
    }
}

impl SourcesConfig {
    pub fn resolved_github_token(&self) -> Option<String> {
        self.github_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()))
    }
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}
fn default_npm_registry() -> String {
    "https://registry.npmjs.org".to_string()
}
fn default_pypi_api() -> String {
    "https://pypi.org/pypi".to_string()
}
fn default_docker_hub_api() -> String {
    "https://hub.docker.com/v2".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Upper bound on source files downloaded per repository.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Larger blobs are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_files() -> usize {
    40
}
fn default_max_file_bytes() -> u64 {
    256 * 1024
}
fn default_include_globs() -> Vec<String> {
    ["py", "js", "mjs", "cjs", "ts", "rs", "go"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Scheduling
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UTC time of the daily content harvest.
    #[serde(default = "default_harvest_at")]
    pub harvest_at: String,
    #[serde(default = "default_refresh_interval_mins")]
    pub refresh_interval_mins: u64,
    /// Entries not harvested for this long are refreshed.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
    #[serde(default = "default_health_at")]
    pub health_at: String,
    #[serde(default = "default_prune_weekday")]
    pub prune_weekday: String,
    #[serde(default = "default_prune_at")]
    pub prune_at: String,
    /// Entries not harvested for this long are deleted.
    #[serde(default = "default_prune_after_days")]
    pub prune_after_days: i64,
    #[serde(default = "default_cache_interval_mins")]
    pub cache_interval_mins: u64,
    /// Pending checkpoints drained per content harvest run.
    #[serde(default = "default_pending_batch")]
    pub pending_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            harvest_at: default_harvest_at(),
            refresh_interval_mins: default_refresh_interval_mins(),
            stale_after_days: default_stale_after_days(),
            health_at: default_health_at(),
            prune_weekday: default_prune_weekday(),
            prune_at: default_prune_at(),
            prune_after_days: default_prune_after_days(),
            cache_interval_mins: default_cache_interval_mins(),
            pending_batch: default_pending_batch(),
        }
    }
}

impl SchedulerConfig {
    pub fn prune_weekday(&self) -> Result<Weekday> {
        self.prune_weekday
            .parse::<Weekday>()
            .map_err(|_| anyhow::anyhow!("invalid weekday: '{}'", self.prune_weekday))
    }
}

/// Parse `"HH:MM"` into `(hour, minute)`.
pub fn parse_time_of_day(value: &str) -> Result<(u32, u32)> {
    let (h, m) = value
        .split_once(':')
        .with_context(|| format!("expected HH:MM, got '{}'", value))?;
    let hour: u32 = h
        .trim()
        .parse()
        .with_context(|| format!("invalid hour in '{}'", value))?;
    let minute: u32 = m
        .trim()
        .parse()
        .with_context(|| format!("invalid minute in '{}'", value))?;
    if hour > 23 || minute > 59 {
        anyhow::bail!("time of day out of range: '{}'", value);
    }
    Ok((hour, minute))
}

fn default_true() -> bool {
    true
}
fn default_harvest_at() -> String {
    "02:00".to_string()
}
fn default_refresh_interval_mins() -> u64 {
    360
}
fn default_stale_after_days() -> i64 {
    7
}
fn default_health_at() -> String {
    "03:30".to_string()
}
fn default_prune_weekday() -> String {
    "sun".to_string()
}
fn default_prune_at() -> String {
    "04:00".to_string()
}
fn default_prune_after_days() -> i64 {
    180
}
fn default_cache_interval_mins() -> u64 {
    60
}
fn default_pending_batch() -> i64 {
    100
}

/// A URL harvested by the daily content job.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SeedConfig {
    pub kind: HostType,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    let h = &config.harvest;
    if h.max_attempts == 0 {
        anyhow::bail!("harvest.max_attempts must be >= 1");
    }
    if h.initial_backoff_secs > h.max_backoff_secs {
        anyhow::bail!("harvest.initial_backoff_secs must not exceed harvest.max_backoff_secs");
    }
    if h.attempt_timeout_secs == 0 {
        anyhow::bail!("harvest.attempt_timeout_secs must be > 0");
    }
    if h.fan_out == 0 {
        anyhow::bail!("harvest.fan_out must be >= 1");
    }

    if config.analysis.max_files == 0 {
        anyhow::bail!("analysis.max_files must be > 0");
    }
    crate::risk::SourceSelector::new(
        &config.analysis.include_globs,
        &config.analysis.exclude_globs,
    )
    .with_context(|| "Invalid glob in [analysis]")?;

    let s = &config.scheduler;
    parse_time_of_day(&s.harvest_at).context("scheduler.harvest_at")?;
    parse_time_of_day(&s.health_at).context("scheduler.health_at")?;
    parse_time_of_day(&s.prune_at).context("scheduler.prune_at")?;
    s.prune_weekday()?;
    if s.refresh_interval_mins == 0 || s.cache_interval_mins == 0 {
        anyhow::bail!("scheduler intervals must be > 0");
    }
    if s.stale_after_days < 1 || s.prune_after_days < 1 {
        anyhow::bail!("scheduler.stale_after_days and prune_after_days must be >= 1");
    }
    if s.pending_batch < 1 {
        anyhow::bail!("scheduler.pending_batch must be >= 1");
    }

    for seed in &config.seeds {
        if seed.url.trim().is_empty() {
            anyhow::bail!("seed URL for kind '{}' is empty", seed.kind);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/catalog.sqlite\"\n").unwrap();
        assert_eq!(config.harvest.max_attempts, 5);
        assert_eq!(config.harvest.fan_out, 4);
        assert_eq!(config.http.max_retries, 2);
        assert_eq!(config.analysis.max_files, 40);
        assert_eq!(config.scheduler.prune_after_days, 180);
        assert!(config.seeds.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [db]
            path = "/tmp/c.sqlite"

            [harvest]
            max_attempts = 3
            fan_out = 8

            [sources]
            github_token = "ghp_x"

            [scheduler]
            harvest_at = "05:15"
            prune_weekday = "sat"

            [[seeds]]
            kind = "npm"
            url = "npm:left-pad"

            [[seeds]]
            kind = "github"
            url = "https://github.com/acme/server"
            "#,
        )
        .unwrap();
        assert_eq!(config.harvest.retry_policy().max_attempts, 3);
        assert_eq!(config.sources.resolved_github_token().as_deref(), Some("ghp_x"));
        assert_eq!(config.scheduler.prune_weekday().unwrap(), Weekday::Sat);
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.seeds[0].kind, HostType::Npm);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse_config("[db]\npath = \"x\"\n[harvest]\nmax_attempts = 0\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[harvest]\nfan_out = 0\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[scheduler]\nharvest_at = \"25:00\"\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[scheduler]\nprune_weekday = \"someday\"\n").is_err());
        assert!(parse_config("[db]\npath = \"x\"\n[analysis]\ninclude_globs = [\"[\"]\n").is_err());
        assert!(parse_config("[[seeds]]\nkind = \"gitlab\"\nurl = \"x\"\n").is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/harvester.example.toml")).unwrap();
        assert_eq!(config.seeds.len(), 3);
        assert_eq!(config.analysis.exclude_globs.len(), 3);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("02:30").unwrap(), (2, 30));
        assert!(parse_time_of_day("2").is_err());
        assert!(parse_time_of_day("12:60").is_err());
    }
}

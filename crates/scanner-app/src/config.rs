//! Configuration loading and validation for the history scanner.
//!
//! The configuration is read from a TOML file and may be partially
//! overridden through environment variables prefixed with `HENYEY_SCANNER_`.
//! Every section and field is optional; missing values take the defaults
//! below.
//!
//! | Section | Description |
//! |---------|-------------|
//! | `scanner` | Chunk size, checkpoint frequency, parallel scans, scheduling policy |
//! | `http` | Retries, backoff, timeouts and request pacing |
//! | `performance` | Concurrency benchmark candidates and slow-archive threshold |
//! | `hasher` | Hashing worker threads and backpressure ceiling |
//! | `archives` | History archive URLs to scan |
//! | `storage` | Location of the JSON scan store |
//! | `logging` | Log level and format |
//!
//! # Example Configuration
//!
//! ```toml
//! [scanner]
//! max_concurrent_scans = 2
//! scheduler = "restart-at-least-one"
//!
//! [archives]
//! urls = [
//!     "https://history.stellar.org/prd/core-live/core_live_001",
//!     "https://history.stellar.org/prd/core-live/core_live_002",
//! ]
//!
//! [storage]
//! path = "/var/lib/history-scanner/scans.json"
//! ```
//!
//! # Environment Overrides
//!
//! - `HENYEY_SCANNER_ARCHIVES` - comma separated archive URLs
//! - `HENYEY_SCANNER_STORAGE_PATH` - scan store path
//! - `HENYEY_SCANNER_RANGE_SIZE` - ledgers per chunk
//! - `HENYEY_SCANNER_MAX_CONCURRENT_SCANS` - archives scanned in parallel
//! - `HENYEY_SCANNER_HTTP_RETRIES` - retries per request
//! - `HENYEY_SCANNER_LOG_LEVEL` - log level (trace, debug, info, warn, error)

use std::path::{Path, PathBuf};
use std::time::Duration;

use henyey_common::Url;
use henyey_history_scanner::{
    CheckPointFrequency, CheckPointGenerator, ContinueAllScans, HasherPoolConfig, HttpSettings,
    PerformanceTestConfig, RestartAtLeastOneScan, ScanScheduler, ScanSettingsConfig,
    CHECKPOINT_FREQUENCY, DEFAULT_RANGE_SIZE,
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "HENYEY_SCANNER_";

/// Complete scanner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub scanner: ScanConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub hasher: HasherConfig,

    #[serde(default)]
    pub archives: ArchivesConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the next round of jobs is derived from previous scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerPolicy {
    /// Continue every chain; restart the oldest one if no archive is new.
    #[default]
    RestartAtLeastOne,
    /// Continue every chain.
    ContinueAll,
}

/// Scan orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Ledgers handed to one range scan.
    #[serde(default = "default_range_size")]
    pub range_size: u32,

    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: u32,

    /// Archives scanned in parallel during one round.
    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,

    /// Ledgers scanned from the tip when a new chain starts on a slow archive.
    #[serde(default = "default_slow_archive_max_ledgers")]
    pub slow_archive_max_ledgers: u32,

    #[serde(default)]
    pub scheduler: SchedulerPolicy,

    /// Only check that files exist instead of verifying their content.
    #[serde(default)]
    pub existence_only: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            range_size: default_range_size(),
            checkpoint_frequency: default_checkpoint_frequency(),
            max_concurrent_scans: default_max_concurrent_scans(),
            slow_archive_max_ledgers: default_slow_archive_max_ledgers(),
            scheduler: SchedulerPolicy::default(),
            existence_only: false,
        }
    }
}

fn default_range_size() -> u32 {
    DEFAULT_RANGE_SIZE
}

fn default_checkpoint_frequency() -> u32 {
    CHECKPOINT_FREQUENCY
}

fn default_max_concurrent_scans() -> usize {
    1
}

fn default_slow_archive_max_ledgers() -> u32 {
    ScanSettingsConfig::default().slow_archive_max_ledgers
}

/// HTTP client behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base of the exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Timeout for HAS files and existence checks.
    #[serde(default = "default_small_file_timeout_ms")]
    pub small_file_timeout_ms: u64,

    /// Timeout for category files and buckets.
    #[serde(default = "default_large_file_timeout_ms")]
    pub large_file_timeout_ms: u64,

    /// Pause after every request. Useful against rate limiting archives.
    #[serde(default)]
    pub stall_time_ms: u64,

    #[serde(default = "default_true")]
    pub ramp_up_connections: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let defaults = HttpSettings::default();
        Self {
            retries: defaults.nr_of_retries,
            retry_base_delay_ms: millis(defaults.retry_base_delay),
            small_file_timeout_ms: millis(defaults.small_file_timeout),
            large_file_timeout_ms: millis(defaults.large_file_timeout),
            stall_time_ms: 0,
            ramp_up_connections: true,
        }
    }
}

fn default_retries() -> u32 {
    HttpSettings::default().nr_of_retries
}

fn default_retry_base_delay_ms() -> u64 {
    millis(HttpSettings::default().retry_base_delay)
}

fn default_small_file_timeout_ms() -> u64 {
    millis(HttpSettings::default().small_file_timeout)
}

fn default_large_file_timeout_ms() -> u64 {
    millis(HttpSettings::default().large_file_timeout)
}

fn default_true() -> bool {
    true
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Concurrency benchmark settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Candidate concurrency levels, highest first.
    #[serde(default = "default_concurrency_candidates")]
    pub concurrency_candidates: Vec<usize>,

    #[serde(default = "default_checkpoints_per_test")]
    pub checkpoints_per_test: u32,

    /// Mean per-file latency above which an archive is slow.
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            concurrency_candidates: default_concurrency_candidates(),
            checkpoints_per_test: default_checkpoints_per_test(),
            slow_threshold_ms: default_slow_threshold_ms(),
        }
    }
}

fn default_concurrency_candidates() -> Vec<usize> {
    PerformanceTestConfig::default().concurrency_candidates
}

fn default_checkpoints_per_test() -> u32 {
    PerformanceTestConfig::default().nr_of_checkpoints
}

fn default_slow_threshold_ms() -> u64 {
    millis(PerformanceTestConfig::default().slow_archive_threshold)
}

/// Hashing worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasherConfig {
    /// Worker threads. Defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_pending: default_max_pending(),
        }
    }
}

fn default_max_pending() -> usize {
    HasherPoolConfig::default().max_pending
}

/// Archives scanned by the `scan` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchivesConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Scan store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("scans.json")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl ScannerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration and apply environment overrides on top.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    /// Apply overrides from an arbitrary lookup keyed by the name without
    /// prefix. Unparsable numbers are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("ARCHIVES") {
            self.archives.urls = val
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(val) = lookup("STORAGE_PATH") {
            self.storage.path = PathBuf::from(val);
        }
        if let Some(size) = lookup("RANGE_SIZE").and_then(|v| v.parse().ok()) {
            self.scanner.range_size = size;
        }
        if let Some(scans) = lookup("MAX_CONCURRENT_SCANS").and_then(|v| v.parse().ok()) {
            self.scanner.max_concurrent_scans = scans;
        }
        if let Some(retries) = lookup("HTTP_RETRIES").and_then(|v| v.parse().ok()) {
            self.http.retries = retries;
        }
        if let Some(val) = lookup("LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scanner.range_size == 0 {
            anyhow::bail!("scanner.range_size must be > 0");
        }
        if self.scanner.checkpoint_frequency == 0 {
            anyhow::bail!("scanner.checkpoint_frequency must be > 0");
        }
        if self.scanner.max_concurrent_scans == 0 {
            anyhow::bail!("scanner.max_concurrent_scans must be > 0");
        }
        if self.performance.concurrency_candidates.is_empty() {
            anyhow::bail!("performance.concurrency_candidates must not be empty");
        }
        if self.performance.concurrency_candidates.contains(&0) {
            anyhow::bail!("performance.concurrency_candidates must all be > 0");
        }
        if self.hasher.workers == Some(0) {
            anyhow::bail!("hasher.workers must be > 0");
        }
        if self.hasher.max_pending == 0 {
            anyhow::bail!("hasher.max_pending must be > 0");
        }
        self.archive_urls()?;
        Ok(())
    }

    /// The configured archives as validated URLs.
    pub fn archive_urls(&self) -> anyhow::Result<Vec<Url>> {
        self.archives
            .urls
            .iter()
            .map(|raw| {
                Url::new(raw).map_err(|e| anyhow::anyhow!("invalid archive URL {raw:?}: {e}"))
            })
            .collect()
    }

    pub fn generator(&self) -> anyhow::Result<CheckPointGenerator> {
        let frequency = CheckPointFrequency::new(self.scanner.checkpoint_frequency)
            .ok_or_else(|| anyhow::anyhow!("scanner.checkpoint_frequency must be > 0"))?;
        Ok(CheckPointGenerator::new(frequency))
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            nr_of_retries: self.http.retries,
            retry_base_delay: Duration::from_millis(self.http.retry_base_delay_ms),
            stall_time: Duration::from_millis(self.http.stall_time_ms),
            ramp_up_connections: self.http.ramp_up_connections,
            small_file_timeout: Duration::from_millis(self.http.small_file_timeout_ms),
            large_file_timeout: Duration::from_millis(self.http.large_file_timeout_ms),
        }
    }

    pub fn hasher_pool_config(&self) -> HasherPoolConfig {
        let defaults = HasherPoolConfig::default();
        HasherPoolConfig {
            workers: self.hasher.workers.unwrap_or(defaults.workers),
            max_pending: self.hasher.max_pending,
        }
    }

    pub fn performance_test_config(&self) -> PerformanceTestConfig {
        PerformanceTestConfig {
            concurrency_candidates: self.performance.concurrency_candidates.clone(),
            nr_of_checkpoints: self.performance.checkpoints_per_test,
            slow_archive_threshold: Duration::from_millis(self.performance.slow_threshold_ms),
        }
    }

    pub fn scan_settings_config(&self) -> ScanSettingsConfig {
        ScanSettingsConfig {
            slow_archive_max_ledgers: self.scanner.slow_archive_max_ledgers,
        }
    }

    pub fn scheduler(&self) -> Box<dyn ScanScheduler> {
        match self.scanner.scheduler {
            SchedulerPolicy::RestartAtLeastOne => Box::new(RestartAtLeastOneScan),
            SchedulerPolicy::ContinueAll => Box::new(ContinueAllScans),
        }
    }

    /// Generate a sample configuration file.
    pub fn sample_config() -> String {
        let mut config = Self::default();
        config.archives.urls = vec![
            "https://history.stellar.org/prd/core-live/core_live_001".to_string(),
            "https://history.stellar.org/prd/core-live/core_live_002".to_string(),
            "https://history.stellar.org/prd/core-live/core_live_003".to_string(),
        ];
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ScannerConfig::default();
        assert_eq!(config.scanner.range_size, 1_000_000);
        assert_eq!(config.scanner.checkpoint_frequency, 64);
        assert_eq!(config.scanner.slow_archive_max_ledgers, 120_960);
        assert_eq!(config.scanner.scheduler, SchedulerPolicy::RestartAtLeastOne);
        assert_eq!(config.http.retries, 3);
        assert_eq!(config.http.retry_base_delay_ms, 1000);
        assert_eq!(config.http.stall_time_ms, 0);
        assert_eq!(config.performance.concurrency_candidates, vec![50, 35, 25, 20, 15, 10, 5]);
        assert!(config.archives.urls.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scanner]
range_size = 6400
scheduler = "continue-all"

[http]
stall_time_ms = 250

[archives]
urls = ["https://history.example.org/archive/"]
"#
        )
        .unwrap();

        let config = ScannerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scanner.range_size, 6400);
        assert_eq!(config.scanner.checkpoint_frequency, 64);
        assert_eq!(config.scanner.scheduler, SchedulerPolicy::ContinueAll);
        assert_eq!(config.http.stall_time_ms, 250);
        assert_eq!(config.http.retries, 3);
        assert_eq!(config.storage.path, PathBuf::from("scans.json"));

        let urls = config.archive_urls().unwrap();
        assert_eq!(urls[0].as_str(), "https://history.example.org/archive");
        assert_eq!(config.http_settings().stall_time, Duration::from_millis(250));
    }

    #[test]
    fn test_from_file_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scanner\nrange_size = ").unwrap();
        assert!(ScannerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ARCHIVES", "https://a.example.org, https://b.example.org,"),
            ("STORAGE_PATH", "/tmp/scans.json"),
            ("RANGE_SIZE", "128"),
            ("MAX_CONCURRENT_SCANS", "not a number"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = ScannerConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.archives.urls, vec!["https://a.example.org", "https://b.example.org"]);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/scans.json"));
        assert_eq!(config.scanner.range_size, 128);
        assert_eq!(config.scanner.max_concurrent_scans, 1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation() {
        let mut config = ScannerConfig::default();
        config.scanner.range_size = 0;
        assert!(config.validate().is_err());

        let mut config = ScannerConfig::default();
        config.scanner.checkpoint_frequency = 0;
        assert!(config.validate().is_err());
        assert!(config.generator().is_err());

        let mut config = ScannerConfig::default();
        config.performance.concurrency_candidates.clear();
        assert!(config.validate().is_err());

        let mut config = ScannerConfig::default();
        config.archives.urls = vec!["not a url".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config_round_trips() {
        let sample = ScannerConfig::sample_config();
        let config: ScannerConfig = toml::from_str(&sample).unwrap();
        assert_eq!(config.archives.urls.len(), 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_hasher_workers_default_to_parallelism() {
        let config = ScannerConfig::default();
        assert_eq!(config.hasher_pool_config().workers, HasherPoolConfig::default().workers);

        let mut config = ScannerConfig::default();
        config.hasher.workers = Some(3);
        assert_eq!(config.hasher_pool_config().workers, 3);
    }
}

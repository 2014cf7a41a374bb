//! Configuration loader and validator for the board sync engine.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::gateway::rate_limit::RateLimit;
use crate::gateway::retry::RetryPolicy;
use crate::gateway::GatewaySettings;
use crate::orchestrator::SyncSettings;
use crate::validate::ValidationRules;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub board: Board,
    pub sync: SyncOptions,
    pub validation: Validation,
    pub mapping: Mapping,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How long staged records of CLEANED batches are kept before `sweep`.
    pub retention_hours: u64,
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// External board API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Board {
    pub api_url: String,
    pub token: String,
    pub api_version: String,
    pub board_id: String,
    #[serde(default)]
    pub subitem_board_id: Option<String>,
}

/// Dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOptions {
    pub max_batch_size: usize,
    pub max_workers: usize,
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    pub rate_limit: RateLimitCfg,
    #[serde(default)]
    pub dry_run: bool,
    /// How long a run's hold on a source survives a crash.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitCfg {
    pub calls_per_interval: u32,
    pub interval_ms: u64,
    pub burst: u32,
}

/// Local business rules applied before any network call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validation {
    pub max_fields: usize,
    pub max_value_len: usize,
}

/// Source column → target column mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mapping {
    /// Ordered subset of source columns that feed the content hash.
    #[serde(default)]
    pub hash_columns: Vec<String>,
    pub columns: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

fn default_true() -> bool {
    true
}

fn default_lease_secs() -> u64 {
    3600
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/board-sync.db", self.app.data_dir))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.app.retention_hours as i64)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        let s = &self.sync;
        GatewaySettings {
            board_id: self.board.board_id.clone(),
            max_workers: s.max_workers,
            call_timeout: Duration::from_millis(s.call_timeout_ms),
            retry: RetryPolicy {
                max_attempts: s.max_retries + 1,
                base_delay: Duration::from_millis(s.backoff_base_ms),
                multiplier: s.backoff_multiplier,
                max_delay: Duration::from_millis(s.backoff_max_ms),
                jitter: s.jitter,
            },
            rate_limit: RateLimit {
                calls_per_interval: s.rate_limit.calls_per_interval,
                interval: Duration::from_millis(s.rate_limit.interval_ms),
                burst: s.rate_limit.burst,
            },
            dry_run: s.dry_run,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            board_id: self.board.board_id.clone(),
            subitem_board_id: self.board.subitem_board_id.clone(),
            max_batch_size: self.sync.max_batch_size,
            max_workers: self.sync.max_workers,
            columns: self.mapping.columns.clone(),
            hash_columns: self.hash_columns(),
            rules: self.validation_rules(),
            retention: self.retention(),
            lease_ttl: chrono::Duration::seconds(self.sync.lease_secs as i64),
        }
    }

    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            max_fields: self.validation.max_fields,
            max_value_len: self.validation.max_value_len,
        }
    }

    /// Columns hashed for change detection, in a fixed order.
    pub fn hash_columns(&self) -> Vec<String> {
        if self.mapping.hash_columns.is_empty() {
            self.mapping.columns.iter().map(|c| c.source.clone()).collect()
        } else {
            self.mapping.hash_columns.clone()
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.board.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("board.api_url must be non-empty"));
    }
    if cfg.board.token.trim().is_empty() {
        return Err(ConfigError::Invalid("board.token must be non-empty"));
    }
    if cfg.board.board_id.trim().is_empty() {
        return Err(ConfigError::Invalid("board.board_id must be non-empty"));
    }

    let s = &cfg.sync;
    if s.max_batch_size == 0 {
        return Err(ConfigError::Invalid("sync.max_batch_size must be > 0"));
    }
    if s.max_workers == 0 {
        return Err(ConfigError::Invalid("sync.max_workers must be > 0"));
    }
    if s.lease_secs == 0 {
        return Err(ConfigError::Invalid("sync.lease_secs must be > 0"));
    }
    if s.call_timeout_ms == 0 {
        return Err(ConfigError::Invalid("sync.call_timeout_ms must be > 0"));
    }
    if s.backoff_multiplier < 1.0 {
        return Err(ConfigError::Invalid("sync.backoff_multiplier must be >= 1"));
    }
    if s.backoff_max_ms < s.backoff_base_ms {
        return Err(ConfigError::Invalid(
            "sync.backoff_max_ms must be >= sync.backoff_base_ms",
        ));
    }
    if s.rate_limit.calls_per_interval == 0 {
        return Err(ConfigError::Invalid(
            "sync.rate_limit.calls_per_interval must be > 0",
        ));
    }
    if s.rate_limit.interval_ms == 0 {
        return Err(ConfigError::Invalid("sync.rate_limit.interval_ms must be > 0"));
    }
    if s.rate_limit.burst == 0 {
        return Err(ConfigError::Invalid("sync.rate_limit.burst must be > 0"));
    }
    if s.rate_limit.burst > s.rate_limit.calls_per_interval {
        return Err(ConfigError::Invalid(
            "sync.rate_limit.burst must not exceed calls_per_interval",
        ));
    }

    if cfg.validation.max_fields == 0 {
        return Err(ConfigError::Invalid("validation.max_fields must be > 0"));
    }
    if cfg.validation.max_value_len == 0 {
        return Err(ConfigError::Invalid("validation.max_value_len must be > 0"));
    }

    if cfg.mapping.columns.is_empty() {
        return Err(ConfigError::Invalid("mapping.columns must not be empty"));
    }
    let mut targets = HashSet::new();
    for col in &cfg.mapping.columns {
        if col.source.trim().is_empty() || col.target.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "mapping.columns entries need a source and a target",
            ));
        }
        if !targets.insert(col.target.as_str()) {
            return Err(ConfigError::Invalid("mapping.columns targets must be unique"));
        }
    }
    let sources: HashSet<&str> = cfg.mapping.columns.iter().map(|c| c.source.as_str()).collect();
    if cfg
        .mapping
        .hash_columns
        .iter()
        .any(|h| !sources.contains(h.as_str()))
    {
        return Err(ConfigError::Invalid(
            "mapping.hash_columns must name mapped source columns",
        ));
    }

    Ok(())
}

/// Returns the example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  retention_hours: 168

board:
  api_url: "https://api.monday.com/v2"
  token: "YOUR_BOARD_API_TOKEN"
  api_version: "2024-10"
  board_id: "1234567890"
  subitem_board_id: "1234567891"

sync:
  max_batch_size: 25
  max_workers: 4
  call_timeout_ms: 30000
  max_retries: 4
  backoff_base_ms: 500
  backoff_multiplier: 2.0
  backoff_max_ms: 30000
  rate_limit:
    calls_per_interval: 60
    interval_ms: 60000
    burst: 10
  dry_run: false
  lease_secs: 3600

validation:
  max_fields: 40
  max_value_len: 2000

mapping:
  hash_columns: ["order_no", "customer", "ship_date", "qty", "status"]
  columns:
    - { source: "order_no", target: "name" }
    - { source: "customer", target: "text_customer" }
    - { source: "ship_date", target: "date_ship" }
    - { source: "qty", target: "numbers_qty" }
    - { source: "status", target: "status" }
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.board.subitem_board_id.as_deref(), Some("1234567891"));
        assert!(cfg.sync.jitter);
    }

    #[test]
    fn invalid_board_token() {
        let mut cfg = example_cfg();
        cfg.board.token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("board.token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_sync_limits() {
        let mut cfg = example_cfg();
        cfg.sync.max_batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.sync.rate_limit.burst = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("burst")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.sync.backoff_multiplier = 0.5;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_mapping() {
        let mut cfg = example_cfg();
        cfg.mapping.columns.push(ColumnMapping {
            source: "other".into(),
            target: "name".into(),
        });
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("unique")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.mapping.hash_columns.push("not_mapped".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn hash_columns_default_to_mapped_sources() {
        let mut cfg = example_cfg();
        cfg.mapping.hash_columns.clear();
        assert_eq!(
            cfg.hash_columns(),
            vec!["order_no", "customer", "ship_date", "qty", "status"]
        );
    }

    #[test]
    fn gateway_settings_follow_sync_section() {
        let cfg = example_cfg();
        let gs = cfg.gateway_settings();
        assert_eq!(gs.retry.max_attempts, 5);
        assert_eq!(gs.rate_limit.calls_per_interval, 60);
        assert_eq!(gs.call_timeout, Duration::from_secs(30));
        assert!(!gs.dry_run);
    }

    #[test]
    fn sync_settings_carry_board_and_mapping() {
        let cfg = example_cfg();
        let ss = cfg.sync_settings();
        assert_eq!(ss.board_id, "1234567890");
        assert_eq!(ss.subitem_board_id.as_deref(), Some("1234567891"));
        assert_eq!(ss.columns.len(), 5);
        assert_eq!(ss.hash_columns, cfg.hash_columns());
        assert_eq!(ss.retention, chrono::Duration::hours(168));
        assert_eq!(ss.lease_ttl, chrono::Duration::hours(1));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.board.board_id, "1234567890");
        assert_eq!(cfg.mapping.columns.len(), 5);
    }
}

// =============================================================================
// Pipeline Configuration — File-backed settings with atomic save
// =============================================================================
//
// Central configuration hub for the coinlake pipeline.  Every tunable lives
// here: upstream API parameters, retry policy, storage layout and lake table
// names.  The file is plain JSON so an operator can edit it between runs.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Secrets never live in the file: the config names the env var that holds
// the API key, and the client resolves it at startup.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_endpoint() -> String {
    "https://api.coingecko.com/api/v3/coins/markets".to_string()
}

fn default_vs_currency() -> String {
    "usd".to_string()
}

fn default_order() -> String {
    "market_cap_desc".to_string()
}

fn default_per_page() -> u32 {
    250
}

fn default_page() -> u32 {
    1
}

fn default_price_change_windows() -> String {
    "1h,24h,7d".to_string()
}

fn default_api_key_header() -> String {
    "x-cg-demo-api-key".to_string()
}

fn default_api_key_env() -> String {
    "COINLAKE_API_KEY".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_zstd_level() -> i32 {
    3
}

fn default_failure_ring_capacity() -> usize {
    256
}

fn default_lock_stale_secs() -> u64 {
    900
}

fn default_normalized_table() -> String {
    "market_snapshots_normalized".to_string()
}

fn default_analytical_table() -> String {
    "market_snapshots".to_string()
}

// =============================================================================
// ApiConfig
// =============================================================================

/// Upstream market-data API parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Snapshot endpoint URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Quote currency for prices and volumes.
    #[serde(default = "default_vs_currency")]
    pub vs_currency: String,

    /// Upstream result ordering.
    #[serde(default = "default_order")]
    pub order: String,

    /// Number of assets per snapshot.
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Result page to fetch.
    #[serde(default = "default_page")]
    pub page: u32,

    /// Comma-separated percentage-change lookback windows.
    #[serde(default = "default_price_change_windows")]
    pub price_change_windows: String,

    /// Header name the API key is sent under.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Env var the API key is read from (the key itself never lives in the
    /// config file).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            vs_currency: default_vs_currency(),
            order: default_order(),
            per_page: default_per_page(),
            page: default_page(),
            price_change_windows: default_price_change_windows(),
            api_key_header: default_api_key_header(),
            api_key_env: default_api_key_env(),
        }
    }
}

// =============================================================================
// RetryConfig
// =============================================================================

/// Retry policy for the market-data client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum fetch attempts before a transient failure escalates to fatal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds (doubles per attempt).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the backoff delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// =============================================================================
// StorageConfig
// =============================================================================

/// Filesystem layout and storage tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory under which raw, normalized and analytical data live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// zstd compression level for normalized JSONL files.
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// How many recent failure events the in-memory ring retains.
    #[serde(default = "default_failure_ring_capacity")]
    pub failure_ring_capacity: usize,

    /// Age in seconds after which an abandoned materialization lock is broken.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            zstd_level: default_zstd_level(),
            failure_ring_capacity: default_failure_ring_capacity(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

impl StorageConfig {
    /// Directory holding verbatim raw payloads.
    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    /// Root of the hour-partitioned normalized layer.
    pub fn normalized_dir(&self) -> PathBuf {
        self.data_dir.join("normalized")
    }

    /// Root of the hour-partitioned analytical (columnar) layer.
    pub fn analytical_dir(&self) -> PathBuf {
        self.data_dir.join("analytical")
    }

    /// Append-only failure event log.
    pub fn failures_path(&self) -> PathBuf {
        self.data_dir.join("failures.jsonl")
    }

    /// Append-only materialization provenance log.
    pub fn provenance_path(&self) -> PathBuf {
        self.data_dir.join("provenance.jsonl")
    }
}

// =============================================================================
// LakeConfig
// =============================================================================

/// Table names and statement template for the materialization layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LakeConfig {
    /// Name of the normalized source table in rendered statements.
    #[serde(default = "default_normalized_table")]
    pub normalized_table: String,

    /// Name of the analytical target table in rendered statements.
    #[serde(default = "default_analytical_table")]
    pub analytical_table: String,

    /// Optional path to a statement template file; when absent the embedded
    /// default template is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_template_path: Option<PathBuf>,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            normalized_table: default_normalized_table(),
            analytical_table: default_analytical_table(),
            statement_template_path: None,
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for the coinlake pipeline.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upstream API parameters.
    #[serde(default)]
    pub api: ApiConfig,

    /// Client retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Filesystem layout and storage tunables.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lake table names and statement template.
    #[serde(default)]
    pub lake: LakeConfig,
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file falls back to defaults with a warning (the pipeline is
    /// fully operable on defaults); a present but malformed file is an error,
    /// since silently ignoring an operator's config would be worse.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            endpoint = %config.api.endpoint,
            data_dir = %config.storage.data_dir.display(),
            "config loaded"
        );

        Ok(config)
    }

    /// Apply process-environment overrides on top of the file config.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(std::env::var("COINLAKE_DATA_DIR").ok());
        self
    }

    fn apply_overrides(&mut self, data_dir: Option<String>) {
        if let Some(dir) = data_dir {
            if !dir.is_empty() {
                info!(data_dir = %dir, "data dir overridden from environment");
                self.storage.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.api.vs_currency, "usd");
        assert_eq!(cfg.api.per_page, 250);
        assert_eq!(cfg.api.page, 1);
        assert_eq!(cfg.api.api_key_env, "COINLAKE_API_KEY");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.storage.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.storage.zstd_level, 3);
        assert_eq!(cfg.lake.normalized_table, "market_snapshots_normalized");
        assert_eq!(cfg.lake.analytical_table, "market_snapshots");
        assert!(cfg.lake.statement_template_path.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.api.per_page, 250);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.storage.failure_ring_capacity, 256);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "api": { "per_page": 50 }, "storage": { "data_dir": "/var/lake" } }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.api.per_page, 50);
        assert_eq!(cfg.api.vs_currency, "usd");
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/var/lake"));
        assert_eq!(cfg.storage.zstd_level, 3);
        assert_eq!(cfg.retry.base_delay_ms, 500);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = PipelineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.api.endpoint, cfg2.api.endpoint);
        assert_eq!(cfg.retry.max_attempts, cfg2.retry.max_attempts);
        assert_eq!(cfg.storage.data_dir, cfg2.storage.data_dir);
        assert_eq!(cfg.lake.analytical_table, cfg2.lake.analytical_table);
    }

    #[test]
    fn storage_paths_hang_off_data_dir() {
        let mut cfg = PipelineConfig::default();
        cfg.storage.data_dir = PathBuf::from("/lake");
        assert_eq!(cfg.storage.raw_dir(), PathBuf::from("/lake/raw"));
        assert_eq!(cfg.storage.normalized_dir(), PathBuf::from("/lake/normalized"));
        assert_eq!(cfg.storage.analytical_dir(), PathBuf::from("/lake/analytical"));
        assert_eq!(cfg.storage.failures_path(), PathBuf::from("/lake/failures.jsonl"));
        assert_eq!(cfg.storage.provenance_path(), PathBuf::from("/lake/provenance.jsonl"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PipelineConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.api.per_page, 250);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        assert!(PipelineConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coinlake.json");
        let mut cfg = PipelineConfig::default();
        cfg.api.per_page = 100;
        cfg.save(&path).unwrap();
        let loaded = PipelineConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.api.per_page, 100);
        // No tmp file left behind after the atomic rename.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn env_override_replaces_data_dir() {
        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(Some("/override/lake".to_string()));
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/override/lake"));

        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(None);
        assert_eq!(cfg.storage.data_dir, PathBuf::from("./data"));
    }
}

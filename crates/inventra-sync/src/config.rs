//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     INVENTRA_REMOTE_URL=https://api.example.com/rest/v1                │
//! │     INVENTRA_CONFLICT_POLICY=keep_remote                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/inventra/inventra.toml (Linux)                           │
//! │     ~/Library/Application Support/com.inventra.inventra/inventra.toml  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     24h cache TTL, 1000-row pages, manual conflict policy              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Back Office"
//!
//! [remote]
//! base_url = "https://api.example.com/rest/v1"
//! api_key = "..."
//! page_size = 1000
//! concurrency = 4
//!
//! [cache]
//! ttl_hours = 24
//! quota_bytes = 268435456
//!
//! [queue]
//! max_attempts = 8
//! conflict_policy = "manual"
//!
//! [realtime]
//! ws_url = "wss://api.example.com/realtime"
//!
//! [stock]
//! low_stock_threshold = 5
//! ```

use std::path::PathBuf;
use std::time::Duration;

use inventra_core::{ResolutionPolicy, StockPolicy, DEFAULT_CACHE_TTL_HOURS, INVENTORY_DATASET, MAX_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Inventory Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Where and how to talk to the remote backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// REST base URL. `None` runs the engine offline against the cache.
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key sent as `apikey` and bearer token.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Rows per page. Clamped to the backend cap.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Concurrent page requests when the total is known.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Hand partial rows to the caller every N rows during a full load.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Interval between background sync cycles (seconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}
fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}
fn default_concurrency() -> usize {
    1
}
fn default_progress_every() -> usize {
    5_000
}
fn default_sync_interval() -> u64 {
    60
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
            concurrency: default_concurrency(),
            progress_every: default_progress_every(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Local snapshot cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Snapshot age after which a sync is attempted before serving.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,

    /// Dataset name the inventory snapshot is stored under.
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Byte quota across all cached datasets.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: i64,

    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_ttl_hours() -> i64 {
    DEFAULT_CACHE_TTL_HOURS
}
fn default_dataset() -> String {
    INVENTORY_DATASET.to_string()
}
fn default_quota_bytes() -> i64 {
    inventra_db::pool::DEFAULT_CACHE_QUOTA_BYTES
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            ttl_hours: default_ttl_hours(),
            dataset: default_dataset(),
            quota_bytes: default_quota_bytes(),
            database_path: None,
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

/// Mutation delivery settings.
///
/// ## Backoff
/// ```text
/// attempt 1 fails → wait ~initial
/// attempt 2 fails → wait ~initial × 2
/// ...                              (capped at max_backoff)
/// 429 responses   → wait × rate_limit_multiplier (or Retry-After)
/// attempt == max_attempts → failed
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Delivery attempts before a mutation is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Initial retry backoff (milliseconds).
    #[serde(default = "default_queue_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum retry backoff (seconds).
    #[serde(default = "default_queue_max_backoff")]
    pub max_backoff_secs: u64,

    /// Backoff multiplier applied to rate-limited deliveries.
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,

    /// Deadline for a single delivery (seconds).
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,

    /// Policy applied to detected conflicts.
    #[serde(default)]
    pub conflict_policy: ResolutionPolicy,
}

fn default_max_attempts() -> i64 {
    8
}
fn default_queue_initial_backoff() -> u64 {
    1_000
}
fn default_queue_max_backoff() -> u64 {
    300
}
fn default_rate_limit_multiplier() -> u32 {
    4
}
fn default_delivery_timeout() -> u64 {
    15
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_queue_initial_backoff(),
            max_backoff_secs: default_queue_max_backoff(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            delivery_timeout_secs: default_delivery_timeout(),
            conflict_policy: ResolutionPolicy::default(),
        }
    }
}

// =============================================================================
// Realtime Settings
// =============================================================================

/// Change feed connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// WebSocket URL of the change feed. `None` disables realtime.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Initial reconnect backoff (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum reconnect backoff (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            ws_url: None,
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Stock Settings
// =============================================================================

/// Stock classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockSettings {
    /// Quantities at or below this (and above zero) are "low".
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: i64,
}

fn default_low_stock_threshold() -> i64 {
    StockPolicy::default().low_stock_threshold
}

impl Default for StockSettings {
    fn default() -> Self {
        StockSettings {
            low_stock_threshold: default_low_stock_threshold(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub realtime: RealtimeSettings,

    #[serde(default)]
    pub stock: StockSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (inventra.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        if let Some(ref url) = self.remote.base_url {
            check_scheme(url, &["http", "https"], "remote.base_url")?;
        }
        if let Some(ref url) = self.realtime.ws_url {
            check_scheme(url, &["ws", "wss"], "realtime.ws_url")?;
        }

        if self.remote.page_size == 0 {
            return Err(SyncError::InvalidConfig("remote.page_size must be greater than 0".into()));
        }
        if self.remote.concurrency == 0 {
            return Err(SyncError::InvalidConfig("remote.concurrency must be at least 1".into()));
        }
        if self.cache.ttl_hours <= 0 {
            return Err(SyncError::InvalidConfig("cache.ttl_hours must be positive".into()));
        }
        if self.cache.quota_bytes <= 0 {
            return Err(SyncError::InvalidConfig("cache.quota_bytes must be positive".into()));
        }
        if self.cache.dataset.trim().is_empty() {
            return Err(SyncError::InvalidConfig("cache.dataset must not be empty".into()));
        }
        if self.queue.max_attempts <= 0 {
            return Err(SyncError::InvalidConfig("queue.max_attempts must be positive".into()));
        }
        if self.queue.rate_limit_multiplier == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.rate_limit_multiplier must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Applies `INVENTRA_*` overrides read through `lookup`.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("INVENTRA_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(url) = lookup("INVENTRA_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.base_url = Some(url);
        }

        if let Some(key) = lookup("INVENTRA_API_KEY") {
            self.remote.api_key = Some(key);
        }

        if let Some(url) = lookup("INVENTRA_REALTIME_URL") {
            debug!(url = %url, "Overriding realtime URL from environment");
            self.realtime.ws_url = Some(url);
        }

        if let Some(size) = lookup("INVENTRA_PAGE_SIZE") {
            match size.parse::<usize>() {
                Ok(n) => self.remote.page_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid INVENTRA_PAGE_SIZE"),
            }
        }

        if let Some(ttl) = lookup("INVENTRA_CACHE_TTL_HOURS") {
            match ttl.parse::<i64>() {
                Ok(h) => self.cache.ttl_hours = h,
                Err(_) => warn!(value = %ttl, "Ignoring invalid INVENTRA_CACHE_TTL_HOURS"),
            }
        }

        if let Some(quota) = lookup("INVENTRA_CACHE_QUOTA_BYTES") {
            match quota.parse::<i64>() {
                Ok(q) => self.cache.quota_bytes = q,
                Err(_) => warn!(value = %quota, "Ignoring invalid INVENTRA_CACHE_QUOTA_BYTES"),
            }
        }

        if let Some(path) = lookup("INVENTRA_DATABASE_PATH") {
            self.cache.database_path = Some(PathBuf::from(path));
        }

        if let Some(policy) = lookup("INVENTRA_CONFLICT_POLICY") {
            match policy.parse() {
                Ok(parsed) => {
                    debug!(policy = %policy, "Overriding conflict policy from environment");
                    self.queue.conflict_policy = parsed;
                }
                Err(_) => warn!(policy = %policy, "Unknown conflict policy in environment"),
            }
        }

        if let Some(threshold) = lookup("INVENTRA_LOW_STOCK_THRESHOLD") {
            match threshold.parse::<i64>() {
                Ok(t) => self.stock.low_stock_threshold = t,
                Err(_) => warn!(value = %threshold, "Ignoring invalid INVENTRA_LOW_STOCK_THRESHOLD"),
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "inventra", "inventra")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("inventra.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the remote base URL if configured.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.base_url.as_deref()
    }

    /// Returns the change feed URL if configured.
    pub fn realtime_url(&self) -> Option<&str> {
        self.realtime.ws_url.as_deref()
    }

    /// SQLite file path: configured, else the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.cache
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("inventra.db")))
            .unwrap_or_else(|| PathBuf::from("inventra.db"))
    }

    /// Page size clamped to the backend cap.
    pub fn page_size(&self) -> usize {
        if self.remote.page_size > MAX_PAGE_SIZE {
            warn!(
                configured = self.remote.page_size,
                cap = MAX_PAGE_SIZE,
                "Page size above backend cap, clamping"
            );
        }
        self.remote.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.remote.sync_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.delivery_timeout_secs)
    }

    /// Cache TTL as a chrono duration (compared against snapshot timestamps).
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache.ttl_hours)
    }

    pub fn stock_policy(&self) -> StockPolicy {
        StockPolicy {
            low_stock_threshold: self.stock.low_stock_threshold,
        }
    }
}

fn check_scheme(raw: &str, schemes: &[&str], field: &str) -> SyncResult<()> {
    let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{field}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(SyncError::InvalidUrl(format!(
            "{field} must use {}, got: {raw}",
            schemes.join(" or ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.cache.ttl_hours, 24);
        assert_eq!(config.page_size(), 1000);
        assert_eq!(config.queue.conflict_policy, ResolutionPolicy::Manual);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(config.validate().is_err());

        config.device.id = "dev-1".to_string();
        config.remote.base_url = Some("ws://wrong-scheme".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.remote.base_url = Some("https://api.example.com/rest/v1".to_string());
        config.realtime.ws_url = Some("https://not-a-socket".to_string());
        assert!(config.validate().is_err());

        config.realtime.ws_url = Some("wss://api.example.com/realtime".to_string());
        assert!(config.validate().is_ok());

        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let mut config = SyncConfig::default();
        config.remote.page_size = 5_000;
        assert_eq!(config.page_size(), MAX_PAGE_SIZE);

        config.remote.page_size = 250;
        assert_eq!(config.page_size(), 250);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("INVENTRA_REMOTE_URL", "https://api.example.com/rest/v1"),
            ("INVENTRA_CONFLICT_POLICY", "keep_remote"),
            ("INVENTRA_PAGE_SIZE", "not-a-number"),
            ("INVENTRA_LOW_STOCK_THRESHOLD", "12"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.remote_url(), Some("https://api.example.com/rest/v1"));
        assert_eq!(config.queue.conflict_policy, ResolutionPolicy::KeepRemote);
        assert_eq!(config.remote.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.stock_policy().low_stock_threshold, 12);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "dev-1"

            [queue]
            conflict_policy = "keep_local"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.name, "Inventory Terminal");
        assert_eq!(config.queue.conflict_policy, ResolutionPolicy::KeepLocal);
        assert_eq!(config.queue.max_attempts, 8);
        assert_eq!(config.cache.dataset, "inventory");
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[queue]"));
        assert!(toml_str.contains("[stock]"));
    }
}

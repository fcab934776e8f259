//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FLOWSTATE_CONFIG)
//! 3. Environment variables

use flowstate_wal::{FsyncPolicy as WalFsyncPolicy, WalConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub coordinator: CoordinatorConfig,
    pub policy: PolicyConfig,
    /// Slot limits per tag, applied at startup.
    pub concurrency_limits: BTreeMap<String, u32>,
    pub events: EventsConfig,
    pub maintenance: MaintenanceConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FLOWSTATE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse(_, reason) => ConfigError::Parse(path.to_path_buf(), reason),
            other => other,
        })
    }

    /// Parses configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(PathBuf::new(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `FLOWSTATE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        self.storage.apply_overrides(&lookup);
        self.coordinator.apply_overrides(&lookup);
        self.policy.apply_overrides(&lookup);
        self.events.apply_overrides(&lookup);
        self.maintenance.apply_overrides(&lookup);

        if let Some(limits) = lookup("FLOWSTATE_CONCURRENCY_LIMITS") {
            for pair in limits.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (tag, limit) = pair
                    .split_once('=')
                    .and_then(|(tag, limit)| Some((tag.trim(), limit.trim().parse().ok()?)))
                    .ok_or_else(|| {
                        ConfigError::Validation(format!("invalid concurrency limit '{}'", pair))
                    })?;
                self.concurrency_limits.insert(tag.to_string(), limit);
            }
        }
        Ok(())
    }

    /// Checks values that would make the runtime unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.wal_segment_size_mb == 0 {
            return Err(ConfigError::Validation(
                "storage.wal_segment_size_mb must be positive".to_string(),
            ));
        }
        if self.events.enabled && self.events.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "events.channel_capacity must be positive when events are enabled".to_string(),
            ));
        }
        if self.maintenance.enabled && self.maintenance.sync_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "maintenance.sync_interval_ms must be positive".to_string(),
            ));
        }
        if self.concurrency_limits.keys().any(|tag| tag.is_empty()) {
            return Err(ConfigError::Validation(
                "concurrency limit tags must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
    /// WAL segment size in megabytes.
    pub wal_segment_size_mb: u64,
    pub fsync_policy: FsyncPolicy,
}

/// Fsync policy for WAL writes.
///
/// Written as `every_write`, `never`, `every_n:<n>` or `every_ms:<ms>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Fsync after N milliseconds.
    EveryMs(u32),
    /// Never fsync, rely on OS (fastest, least safe).
    Never,
}

impl FsyncPolicy {
    /// Parses `every_write`, `never`, `every_n:<n>` or `every_ms:<ms>`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.to_lowercase();
        match value.as_str() {
            "every_write" | "everywrite" => Some(FsyncPolicy::EveryWrite),
            "never" => Some(FsyncPolicy::Never),
            s => {
                if let Some(n) = s.strip_prefix("every_n:") {
                    n.parse().ok().map(FsyncPolicy::EveryN)
                } else if let Some(ms) = s.strip_prefix("every_ms:") {
                    ms.parse().ok().map(FsyncPolicy::EveryMs)
                } else {
                    None
                }
            }
        }
    }
}

impl TryFrom<String> for FsyncPolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown fsync policy '{}'", value))
    }
}

impl From<FsyncPolicy> for String {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryWrite => "every_write".to_string(),
            FsyncPolicy::EveryN(n) => format!("every_n:{}", n),
            FsyncPolicy::EveryMs(ms) => format!("every_ms:{}", ms),
            FsyncPolicy::Never => "never".to_string(),
        }
    }
}

impl From<FsyncPolicy> for WalFsyncPolicy {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryWrite => WalFsyncPolicy::EveryWrite,
            FsyncPolicy::EveryN(n) => WalFsyncPolicy::EveryN(n),
            FsyncPolicy::EveryMs(ms) => WalFsyncPolicy::EveryMs(ms),
            FsyncPolicy::Never => WalFsyncPolicy::Never,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_segment_size_mb: 64,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

impl StorageConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FLOWSTATE_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(mb) = lookup("FLOWSTATE_WAL_SEGMENT_SIZE_MB").and_then(|v| v.parse().ok()) {
            self.wal_segment_size_mb = mb;
        }

        if let Some(policy) = lookup("FLOWSTATE_FSYNC_POLICY") {
            match FsyncPolicy::parse(&policy) {
                Some(parsed) => self.fsync_policy = parsed,
                None => tracing::warn!(%policy, "Ignoring unknown FLOWSTATE_FSYNC_POLICY"),
            }
        }
    }

    /// Returns the WAL segment size in bytes.
    pub fn wal_segment_size(&self) -> u64 {
        self.wal_segment_size_mb * 1024 * 1024
    }

    /// Returns the WAL directory path.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig::new(self.wal_dir())
            .with_segment_size(self.wal_segment_size())
            .with_fsync_policy(self.fsync_policy.into())
    }
}

/// Per-run lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a proposal waits for its run's lock.
    pub lock_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("FLOWSTATE_LOCK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.lock_timeout_ms = ms;
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Rule policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Run core orchestration rules in addition to global rules.
    pub apply_core_rules: bool,
    /// Retries granted to runs created without explicit settings.
    pub default_max_retries: u32,
    pub default_retry_delay_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            apply_core_rules: true,
            default_max_retries: 0,
            default_retry_delay_secs: 0,
        }
    }
}

impl PolicyConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(apply) = lookup("FLOWSTATE_APPLY_CORE_RULES") {
            self.apply_core_rules = parse_bool(&apply);
        }
        if let Some(n) = lookup("FLOWSTATE_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.default_max_retries = n;
        }
        if let Some(secs) = lookup("FLOWSTATE_RETRY_DELAY_SECS").and_then(|v| v.parse().ok()) {
            self.default_retry_delay_secs = secs;
        }
    }
}

/// State event fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Buffered events per broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1024,
        }
    }
}

impl EventsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("FLOWSTATE_EVENTS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Some(n) = lookup("FLOWSTATE_EVENTS_CAPACITY").and_then(|v| v.parse().ok()) {
            self.channel_capacity = n;
        }
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    /// Interval between WAL syncs in milliseconds.
    pub sync_interval_ms: u64,
    /// Interval between store snapshots in seconds (0 = disabled). Each
    /// snapshot lets the log segments before it be deleted.
    pub checkpoint_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_ms: 1000,
            checkpoint_interval_secs: 300,
        }
    }
}

impl MaintenanceConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("FLOWSTATE_MAINTENANCE_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Some(ms) = lookup("FLOWSTATE_SYNC_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.sync_interval_ms = ms;
        }
        if let Some(secs) =
            lookup("FLOWSTATE_CHECKPOINT_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.checkpoint_interval_secs = secs;
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Returns `None` when checkpoints are disabled.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0)
            .then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

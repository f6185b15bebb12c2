//! # Sync Configuration
//!
//! Configuration management for the replication engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HEARTH_HOUSEHOLD_ID=household-42                                   │
//! │     HEARTH_SYNC_ENABLED=false                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/hearth/sync.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.hearth.hearth/sync.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     LWW, 3 attempts, 5s fixed delay, realtime push                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [household]
//! id = "household-42"
//! name = "Flat 3B"
//!
//! [user]
//! id = "user-alice"
//! display_name = "Alice"
//!
//! [sync]
//! enabled = true
//! conflict_mode = "last_write_wins"
//! max_attempts = 3
//! retry_delay_ms = 5000
//! backoff = "fixed"
//! realtime = true
//! backend_url = "wss://sync.example.com/ws"
//!
//! [storage]
//! database_path = "/var/lib/hearth/hearth.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use hearth_core::{ConflictMode, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};

use crate::adapter::{LocalAdapter, SyncAdapter, WsAdapter};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Household / User
// =============================================================================

/// The household this device replicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HouseholdConfig {
    /// Household identifier; one replication domain.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,
}

/// The user operating this device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Stamped as `origin_user_id` on every local change.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub display_name: String,
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Retry spacing as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Sync behavior settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// `false` runs the engine against the Local Adapter (local-only mode).
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub conflict_mode: ConflictMode,

    /// Retry ceiling: push attempts before an action is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts (milliseconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Cap for exponential backoff (seconds).
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// Drain right after every local change when online.
    #[serde(default = "default_true")]
    pub realtime: bool,

    /// WebSocket URL of the sync backend.
    #[serde(default)]
    pub backend_url: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bound on every push / pull round trip (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Wait after coming online before draining (milliseconds).
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Background sync period (seconds); 0 disables.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}
fn default_max_retry_delay() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    15
}
fn default_settle_delay() -> u64 {
    1_500
}
fn default_poll_interval() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: true,
            conflict_mode: ConflictMode::default(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            backoff: BackoffKind::default(),
            max_retry_delay_secs: default_max_retry_delay(),
            realtime: true,
            backend_url: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            settle_delay_ms: default_settle_delay(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file; the platform data directory when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete per-session configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub household: HouseholdConfig,

    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl SyncConfig {
    /// Creates a config with defaults for one household and user.
    pub fn new(household_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.household.id = household_id.into();
        config.user.id = user_id.into();
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
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

        config.apply_env_overrides();
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
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.household.id.trim().is_empty() {
            return Err(SyncError::MissingHouseholdId);
        }

        if self.user.id.trim().is_empty() {
            return Err(SyncError::MissingUserId);
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }

        if self.sync.conflict_mode != ConflictMode::LastWriteWins {
            return Err(SyncError::InvalidConfig(format!(
                "conflict_mode '{}' is not supported; use last_write_wins",
                self.sync.conflict_mode
            )));
        }

        if let Some(ref url) = self.sync.backend_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Backend URL must start with ws:// or wss://, got: {}",
                    url
                )));
            }
        }

        Ok(())
    }

    /// Applies `HEARTH_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("HEARTH_HOUSEHOLD_ID") {
            debug!(household_id = %id, "Overriding household ID from environment");
            self.household.id = id;
        }

        if let Some(id) = lookup("HEARTH_USER_ID") {
            debug!(user_id = %id, "Overriding user ID from environment");
            self.user.id = id;
        }

        if let Some(enabled) = lookup("HEARTH_SYNC_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.sync.enabled = true,
                "0" | "false" | "no" | "off" => self.sync.enabled = false,
                _ => warn!(value = %enabled, "Unknown HEARTH_SYNC_ENABLED value"),
            }
        }

        if let Some(url) = lookup("HEARTH_BACKEND_URL") {
            debug!(url = %url, "Overriding backend URL from environment");
            self.sync.backend_url = Some(url);
        }

        if let Some(attempts) = lookup("HEARTH_MAX_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.sync.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Invalid HEARTH_MAX_ATTEMPTS"),
            }
        }

        if let Some(delay) = lookup("HEARTH_RETRY_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(ms) => self.sync.retry_delay_ms = ms,
                Err(_) => warn!(value = %delay, "Invalid HEARTH_RETRY_DELAY_MS"),
            }
        }

        if let Some(path) = lookup("HEARTH_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "hearth", "hearth")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the SQLite path: configured, or the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage.database_path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "hearth", "hearth")
                .map(|dirs| dirs.data_dir().join("hearth.db"))
        })
    }

    // =========================================================================
    // Derived Settings
    // =========================================================================

    pub fn household_id(&self) -> &str {
        &self.household.id
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    /// The retry policy the offline queue applies.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.sync.retry_delay_ms);
        match self.sync.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.sync.max_attempts, delay),
            BackoffKind::Exponential => RetryPolicy::exponential(
                self.sync.max_attempts,
                delay,
                Duration::from_secs(self.sync.max_retry_delay_secs),
            ),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.sync.settle_delay_ms)
    }

    /// Background sync period, `None` when disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.sync.poll_interval_secs > 0).then(|| Duration::from_secs(self.sync.poll_interval_secs))
    }

    /// Builds the adapter this configuration asks for.
    ///
    /// Sync disabled selects the Local Adapter; otherwise the WebSocket
    /// adapter, which needs `backend_url`.
    pub fn build_adapter(&self) -> SyncResult<Arc<dyn SyncAdapter>> {
        if !self.sync.enabled {
            info!("Sync disabled, using local adapter");
            return Ok(Arc::new(LocalAdapter::new()));
        }

        let url = self.sync.backend_url.as_deref().ok_or_else(|| {
            SyncError::InvalidConfig("backend_url is required when sync is enabled".into())
        })?;

        let adapter = WsAdapter::new(url, self.connect_timeout(), self.request_timeout())?;
        Ok(Arc::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::BackoffStrategy;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_default_settings() {
        let config = SyncConfig::new("h1", "alice");
        assert!(config.sync.enabled);
        assert!(config.sync.realtime);
        assert_eq!(config.sync.conflict_mode, ConflictMode::LastWriteWins);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();
        assert!(matches!(config.validate(), Err(SyncError::MissingHouseholdId)));

        config.household.id = "h1".into();
        assert!(matches!(config.validate(), Err(SyncError::MissingUserId)));

        config.user.id = "alice".into();
        assert!(config.validate().is_ok());

        config.sync.backend_url = Some("http://invalid".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.sync.backend_url = Some("wss://sync.example.com/ws".into());
        assert!(config.validate().is_ok());

        config.sync.max_attempts = 0;
        assert!(config.validate().is_err());

        config.sync.max_attempts = 3;
        config.sync.conflict_mode = ConflictMode::Manual;
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_toml_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::new("h1", "alice");
        config.sync.backoff = BackoffKind::Exponential;
        config.sync.backend_url = Some("ws://127.0.0.1:9000/ws".into());
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[household]"));
        assert!(contents.contains("[sync]"));

        let parsed: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [household]
            id = "h9"

            [user]
            id = "bob"

            [sync]
            max_attempts = 5
            backoff = "exponential"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.sync.max_attempts, 5);
        assert_eq!(parsed.sync.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert!(matches!(
            parsed.retry_policy().strategy,
            BackoffStrategy::Exponential { .. }
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HEARTH_HOUSEHOLD_ID", "h-env"),
            ("HEARTH_SYNC_ENABLED", "false"),
            ("HEARTH_MAX_ATTEMPTS", "7"),
            ("HEARTH_RETRY_DELAY_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::new("h1", "alice");
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.household_id(), "h-env");
        assert_eq!(config.user_id(), "alice");
        assert!(!config.sync.enabled);
        assert_eq!(config.sync.max_attempts, 7);
        assert_eq!(config.sync.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
    }

    #[test]
    fn test_build_adapter() {
        let mut config = SyncConfig::new("h1", "alice");
        config.sync.enabled = false;
        assert_eq!(config.build_adapter().unwrap().name(), "local");

        config.sync.enabled = true;
        assert!(config.build_adapter().is_err());

        config.sync.backend_url = Some("ws://127.0.0.1:9000/ws".into());
        assert_eq!(config.build_adapter().unwrap().name(), "websocket");
    }
}

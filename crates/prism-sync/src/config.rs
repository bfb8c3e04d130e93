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
//! │     PRISM_HUB_URL=http://homeassistant.local:8123                      │
//! │     PRISM_HUB_TOKEN=eyJhbGciOi...                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     $PRISM_CONFIG, or                                                  │
//! │     ~/.config/prism/config.toml (Linux)                                │
//! │     ~/Library/Application Support/com.prism.desktop/config.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [hub]
//! url = "http://homeassistant.local:8123"
//!
//! [sync]
//! command_timeout_ms = 10000
//! max_backoff_secs = 30
//! event_types = ["state_changed", "call_service"]
//!
//! [filter]
//! entities = ["light", "media_player.living_room"]
//!
//! [actions]
//! debounce_ms = 500
//! ```
//!
//! The access token is read from the file when present but never written
//! back; `PRISM_HUB_TOKEN` is the usual source.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use prism_core::validation::{validate_domain, validate_entity_key};
use prism_core::DEFAULT_DEBOUNCE_MS;

use crate::error::{SyncError, SyncResult};

/// Path that completes a hub base URL to its WebSocket endpoint.
pub const WEBSOCKET_PATH: &str = "/api/websocket";

// =============================================================================
// Access Token
// =============================================================================

/// Long-lived hub access token. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    /// The raw secret, for the auth frame only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

// =============================================================================
// Hub Settings
// =============================================================================

/// Where the hub lives and how to authenticate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSettings {
    /// Base URL (`http://host:8123`) or full WebSocket URL.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default, skip_serializing)]
    pub token: Option<AccessToken>,
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Session, command and reconnection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed for each handshake step (seconds).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// First reconnection delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnection delay cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomization factor in `[0, 1)`. 0 disables jitter.
    #[serde(default)]
    pub backoff_jitter: f64,

    /// A synced period longer than this resets the backoff (seconds).
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold_secs: u64,

    /// Consecutive failed attempts before giving up.
    /// Set to 0 for infinite retries.
    #[serde(default)]
    pub max_retries: u32,

    /// How long a command may wait for its result (milliseconds).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// How often pending command deadlines are checked (milliseconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// WebSocket keepalive ping interval (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Time to wait for a pong before declaring the connection dead (seconds).
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Hub event types to subscribe to after every (re)connect.
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_stability_threshold() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    10_000
}
fn default_sweep_interval() -> u64 {
    250
}
fn default_ping_interval() -> u64 {
    30
}
fn default_pong_timeout() -> u64 {
    10
}
fn default_event_types() -> Vec<String> {
    vec!["state_changed".to_string(), "call_service".to_string()]
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: 0.0,
            stability_threshold_secs: default_stability_threshold(),
            max_retries: 0,
            command_timeout_ms: default_command_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            event_types: default_event_types(),
        }
    }
}

impl SyncSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn stability_threshold(&self) -> Duration {
        Duration::from_secs(self.stability_threshold_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

// =============================================================================
// Filter & Action Settings
// =============================================================================

/// Which entities to mirror.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Entity keys (`light.kitchen`) or whole domains (`light`).
    /// Empty mirrors everything.
    #[serde(default)]
    pub entities: Vec<String>,
}

/// Widget action behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSettings {
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

fn default_debounce() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

impl Default for ActionSettings {
    fn default() -> Self {
        ActionSettings {
            debounce_ms: default_debounce(),
        }
    }
}

impl ActionSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub filter: FilterSettings,

    #[serde(default)]
    pub actions: ActionSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (explicit path, `PRISM_CONFIG`, or the platform default)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
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
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file. The token is not written.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref url) = self.hub.url {
            normalize_hub_url(url)?;
        }

        let s = &self.sync;
        if s.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be greater than 0".into(),
            ));
        }
        if s.max_backoff().as_millis() < u128::from(s.initial_backoff_ms) {
            return Err(SyncError::InvalidConfig(
                "max_backoff_secs must not be below initial_backoff_ms".into(),
            ));
        }
        if !(s.backoff_multiplier >= 1.0) {
            return Err(SyncError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..1.0).contains(&s.backoff_jitter) {
            return Err(SyncError::InvalidConfig(
                "backoff_jitter must be in [0, 1)".into(),
            ));
        }
        if s.command_timeout_ms == 0 || s.sweep_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "command_timeout_ms and sweep_interval_ms must be greater than 0".into(),
            ));
        }
        let timings = [
            ("connect_timeout_secs", s.connect_timeout_secs),
            ("handshake_timeout_secs", s.handshake_timeout_secs),
            ("ping_interval_secs", s.ping_interval_secs),
            ("pong_timeout_secs", s.pong_timeout_secs),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::InvalidConfig(format!(
                "{} must be greater than 0",
                name
            )));
        }
        if s.event_types.is_empty() {
            return Err(SyncError::InvalidConfig(
                "event_types must name at least one event".into(),
            ));
        }
        for event_type in &s.event_types {
            validate_domain(event_type).map_err(|e| {
                SyncError::InvalidConfig(format!("event type '{}': {}", event_type, e))
            })?;
        }

        for pattern in &self.filter.entities {
            let valid = if pattern.contains('.') {
                validate_entity_key(pattern).is_ok()
            } else {
                validate_domain(pattern).is_ok()
            };
            if !valid {
                return Err(SyncError::InvalidConfig(format!(
                    "filter entry '{}' is neither an entity key nor a domain",
                    pattern
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PRISM_HUB_URL") {
            debug!(url = %url, "Overriding hub URL from environment");
            self.hub.url = Some(url);
        }

        if let Ok(token) = std::env::var("PRISM_HUB_TOKEN") {
            debug!("Using hub token from environment");
            self.hub.token = Some(AccessToken::new(token));
        }

        if let Ok(timeout) = std::env::var("PRISM_COMMAND_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.sync.command_timeout_ms = ms,
                Err(_) => warn!(value = %timeout, "Ignoring invalid PRISM_COMMAND_TIMEOUT_MS"),
            }
        }

        if let Ok(backoff) = std::env::var("PRISM_MAX_BACKOFF_SECS") {
            match backoff.parse::<u64>() {
                Ok(secs) => self.sync.max_backoff_secs = secs,
                Err(_) => warn!(value = %backoff, "Ignoring invalid PRISM_MAX_BACKOFF_SECS"),
            }
        }

        if let Ok(entities) = std::env::var("PRISM_ENTITIES") {
            self.filter.entities = entities
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Config file location: `PRISM_CONFIG`, else the platform config dir.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PRISM_CONFIG") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        directories::ProjectDirs::from("com", "prism", "desktop")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// The hub WebSocket endpoint derived from `hub.url`.
    pub fn websocket_url(&self) -> SyncResult<String> {
        let raw = self
            .hub
            .url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("hub.url is not set".into()))?;
        normalize_hub_url(raw)
    }

    /// The configured token, if any non-empty one was supplied.
    pub fn token(&self) -> SyncResult<AccessToken> {
        self.hub
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(SyncError::MissingToken)
    }
}

/// Turns a hub base URL into its WebSocket endpoint.
///
/// ```rust
/// use prism_sync::config::normalize_hub_url;
///
/// assert_eq!(
///     normalize_hub_url("https://ha.example.com/").unwrap(),
///     "wss://ha.example.com/api/websocket"
/// );
/// ```
pub fn normalize_hub_url(raw: &str) -> SyncResult<String> {
    let mut url = Url::parse(raw.trim())?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, raw
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(format!("cannot use {} with {}", scheme, raw)))?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with(WEBSOCKET_PATH) {
        url.set_path(&format!("{}{}", path, WEBSOCKET_PATH));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "PRISM_HUB_URL",
        "PRISM_HUB_TOKEN",
        "PRISM_COMMAND_TIMEOUT_MS",
        "PRISM_MAX_BACKOFF_SECS",
        "PRISM_ENTITIES",
        "PRISM_CONFIG",
    ];

    /// Serializes env-touching tests and restores the variables afterwards.
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = ENV_VARS
                .iter()
                .map(|name| (*name, env::var(name).ok()))
                .collect();
            for name in ENV_VARS {
                env::remove_var(name);
            }
            EnvGuard { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.sync.initial_backoff(), Duration::from_secs(1));
        assert_eq!(config.sync.max_backoff(), Duration::from_secs(30));
        assert_eq!(config.sync.event_types, vec!["state_changed", "call_service"]);
        assert_eq!(config.actions.debounce(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalize_hub_url() {
        assert_eq!(
            normalize_hub_url("http://homeassistant.local:8123").unwrap(),
            "ws://homeassistant.local:8123/api/websocket"
        );
        assert_eq!(
            normalize_hub_url("wss://ha.example.com/api/websocket").unwrap(),
            "wss://ha.example.com/api/websocket"
        );
        assert_eq!(
            normalize_hub_url("http://10.0.0.2:8123/ha/").unwrap(),
            "ws://10.0.0.2:8123/ha/api/websocket"
        );
        assert!(normalize_hub_url("ftp://ha.local").is_err());
        assert!(normalize_hub_url("not a url").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.hub.url = Some("mqtt://broker".into());
        assert!(config.validate().is_err());
        config.hub.url = Some("http://ha.local:8123".into());
        assert!(config.validate().is_ok());

        config.sync.backoff_jitter = 1.5;
        assert!(config.validate().is_err());
        config.sync.backoff_jitter = 0.0;

        config.sync.ping_interval_secs = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(m)) if m.contains("ping_interval_secs")));
        config.sync.ping_interval_secs = 30;
        config.sync.pong_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.sync.pong_timeout_secs = 10;
        config.sync.connect_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.sync.connect_timeout_secs = 10;
        config.sync.handshake_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.sync.handshake_timeout_secs = 10;
        assert!(config.validate().is_ok());

        config.sync.event_types.clear();
        assert!(config.validate().is_err());
        config.sync.event_types = default_event_types();

        config.filter.entities = vec!["light".into(), "switch.fan".into()];
        assert!(config.validate().is_ok());
        config.filter.entities = vec!["Light Kitchen".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_is_redacted_and_not_saved() {
        let mut config = SyncConfig::default();
        config.hub.url = Some("http://ha.local:8123".into());
        config.hub.token = Some(AccessToken::new("super-secret"));

        assert!(!format!("{:?}", config).contains("super-secret"));
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(!toml_str.contains("super-secret"));
        assert!(toml_str.contains("[hub]"));
        assert!(toml_str.contains("[sync]"));
    }

    #[test]
    fn test_missing_token() {
        let mut config = SyncConfig::default();
        assert!(matches!(config.token(), Err(SyncError::MissingToken)));

        config.hub.token = Some(AccessToken::new("  "));
        assert!(matches!(config.token(), Err(SyncError::MissingToken)));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = EnvGuard::new();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");

        env::set_var("PRISM_HUB_URL", "https://ha.example.com");
        env::set_var("PRISM_HUB_TOKEN", "from-env");
        env::set_var("PRISM_COMMAND_TIMEOUT_MS", "2500");
        env::set_var("PRISM_ENTITIES", "light, media_player.tv ,");

        let config = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(config.websocket_url().unwrap(), "wss://ha.example.com/api/websocket");
        assert_eq!(config.token().unwrap().expose(), "from-env");
        assert_eq!(config.sync.command_timeout_ms, 2500);
        assert_eq!(config.filter.entities, vec!["light", "media_player.tv"]);
    }

    #[test]
    fn test_invalid_env_number_is_ignored() {
        let _guard = EnvGuard::new();
        let dir = tempfile::TempDir::new().unwrap();

        env::set_var("PRISM_MAX_BACKOFF_SECS", "soon");
        let config = SyncConfig::load(Some(dir.path().join("none.toml"))).unwrap();
        assert_eq!(config.sync.max_backoff_secs, 30);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let _guard = EnvGuard::new();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SyncConfig::default();
        config.hub.url = Some("http://ha.local:8123".into());
        config.hub.token = Some(AccessToken::new("secret"));
        config.sync.command_timeout_ms = 4000;
        config.filter.entities = vec!["light".into()];
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.hub.url.as_deref(), Some("http://ha.local:8123"));
        assert!(loaded.hub.token.is_none());
        assert_eq!(loaded.sync.command_timeout_ms, 4000);
        assert_eq!(loaded.filter.entities, vec!["light"]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let _guard = EnvGuard::new();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[hub]\nurl = \"http://ha.local:8123\"\ntoken = \"abc\"\n").unwrap();

        let config = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(config.token().unwrap().expose(), "abc");
        assert_eq!(config.sync.connect_timeout_secs, 10);
        assert!(config.filter.entities.is_empty());
    }
}

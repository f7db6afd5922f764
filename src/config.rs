//! Konfiguration
//!
//! Reihenfolge der Quellen:
//! 1. Defaults (produktive Relay- und Token-URLs)
//! 2. Optionale `config.json` im App-Konfigurationsverzeichnis
//! 3. Umgebungsvariablen (`TENTEN_*`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Media-Relay Server (LiveKit Cloud)
pub const DEFAULT_RELAY_URL: &str = "wss://tentwenty-bp8gb2jg.livekit.cloud";

/// Endpoint für kurzlebige Room-Tokens
pub const DEFAULT_TOKEN_URL: &str =
    "https://us-central1-tentenv2-36556.cloudfunctions.net/handleLivekitToken";

/// Obergrenze für jede Netzwerk-Operation des Coordinators
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 15;

/// Anzahl Keep-Alive Ticks pro Lease
pub const DEFAULT_KEEPALIVE_TICKS: u32 = 30;

/// Abstand zwischen zwei Keep-Alive Ticks
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 1000;

const ENV_RELAY_URL: &str = "TENTEN_RELAY_URL";
const ENV_TOKEN_URL: &str = "TENTEN_TOKEN_URL";
const ENV_OPERATION_TIMEOUT: &str = "TENTEN_OPERATION_TIMEOUT_SECS";
const ENV_KEEPALIVE_TICKS: &str = "TENTEN_KEEPALIVE_TICKS";
const ENV_KEEPALIVE_INTERVAL: &str = "TENTEN_KEEPALIVE_INTERVAL_MS";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid URL for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

// ============================================================================
// CONFIG
// ============================================================================

/// Einstellungen für die Keep-Alive Schleife
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepAliveConfig {
    pub ticks_per_lease: u32,
    pub tick_interval_ms: u64,
}

impl KeepAliveConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            ticks_per_lease: DEFAULT_KEEPALIVE_TICKS,
            tick_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
        }
    }
}

/// Gesamtkonfiguration des Call-Cores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub relay_url: String,
    pub token_url: String,
    pub operation_timeout_secs: u64,
    pub keep_alive: KeepAliveConfig,
    pub command_queue_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            keep_alive: KeepAliveConfig::default(),
            command_queue_capacity: 64,
            event_channel_capacity: 100,
        }
    }
}

impl Config {
    /// Lädt die Konfiguration aus allen Quellen
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Liest eine JSON-Konfigurationsdatei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Überschreibt Werte aus Umgebungsvariablen
    ///
    /// `lookup` ist austauschbar, damit Tests nicht die Prozess-Umgebung ändern müssen.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RELAY_URL) {
            self.relay_url = url;
        }
        if let Some(url) = lookup(ENV_TOKEN_URL) {
            self.token_url = url;
        }
        if let Some(value) = lookup(ENV_OPERATION_TIMEOUT) {
            self.operation_timeout_secs = parse_number(ENV_OPERATION_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_KEEPALIVE_TICKS) {
            self.keep_alive.ticks_per_lease = parse_number(ENV_KEEPALIVE_TICKS, &value)?;
        }
        if let Some(value) = lookup(ENV_KEEPALIVE_INTERVAL) {
            self.keep_alive.tick_interval_ms = parse_number(ENV_KEEPALIVE_INTERVAL, &value)?;
        }
        Ok(())
    }

    /// Prüft URLs und Grenzwerte
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay_url()?;
        self.token_url()?;

        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "operationTimeoutSecs",
                value: "0".to_string(),
            });
        }
        if self.keep_alive.ticks_per_lease == 0 {
            return Err(ConfigError::InvalidValue {
                name: "keepAlive.ticksPerLease",
                value: "0".to_string(),
            });
        }
        if self.command_queue_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "channel capacity",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.relay_url).map_err(|source| ConfigError::InvalidUrl {
            field: "relayUrl",
            source,
        })
    }

    pub fn token_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.token_url).map_err(|source| ConfigError::InvalidUrl {
            field: "tokenUrl",
            source,
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    ///
    /// - Linux: `~/.config/tenten/config.json`
    /// - macOS: `~/Library/Application Support/tech.komaki.tenten/config.json`
    fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("tech", "komaki", "tenten")?;
        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push("config.json");
        Some(path)
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.operation_timeout(), Duration::from_secs(15));
        assert_eq!(config.keep_alive.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.keep_alive.ticks_per_lease, 30);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TENTEN_RELAY_URL", "wss://relay.example.com"),
            ("TENTEN_KEEPALIVE_TICKS", "5"),
            ("TENTEN_OPERATION_TIMEOUT_SECS", " 3 "),
        ]);

        let mut config = Config::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.relay_url, "wss://relay.example.com");
        assert_eq!(config.keep_alive.ticks_per_lease, 5);
        assert_eq!(config.operation_timeout_secs, 3);
        assert_eq!(config.token_url, DEFAULT_TOKEN_URL);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let result = config.apply_env(|name| {
            (name == "TENTEN_KEEPALIVE_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "operationTimeoutSecs": 5, "keepAlive": { "ticksPerLease": 10 } }"#)
                .unwrap();

        assert_eq!(config.operation_timeout_secs, 5);
        assert_eq!(config.keep_alive.ticks_per_lease, 10);
        assert_eq!(config.keep_alive.tick_interval_ms, DEFAULT_KEEPALIVE_INTERVAL_MS);
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = Config {
            relay_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { field: "relayUrl", .. })
        ));
    }
}

//! Configuration file support

use sapp_session::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default limit for a single credential request
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration for sapp
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the backend serving `/api/livekit`
    pub backend_url: Option<String>,
    /// Password for HTTP Basic auth against the backend
    pub basic_password: Option<String>,
    /// Delay before user transcription replaces the current entry
    pub debounce_ms: Option<u64>,
    /// Number of completed transcript entries to keep
    pub history_limit: Option<usize>,
    /// Credential request timeout
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sapp")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SAPP_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file, then apply environment overrides
    pub fn load() -> Self {
        let path = Self::config_path();
        let config = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match Self::from_toml(&content) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `SAPP_BACKEND_URL` and `SAPP_BASIC_PASSWORD`, which take
    /// precedence over the file.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("SAPP_BACKEND_URL") {
            self.backend_url = Some(url);
        }
        if let Some(password) = lookup("SAPP_BASIC_PASSWORD") {
            self.basic_password = Some(password);
        }
        self
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            backend_url: Some("http://localhost:7860".to_string()),
            basic_password: None,
            debounce_ms: Some(200),
            history_limit: Some(20),
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        default_config.save()?;
        Ok(path)
    }

    /// Engine settings, with defaults for anything unset
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        if let Some(ms) = self.debounce_ms {
            engine.debounce = Duration::from_millis(ms);
        }
        if let Some(limit) = self.history_limit {
            engine.history_limit = limit.max(1);
        }
        engine
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# sapp configuration file
# Place at ~/.config/sapp/config.toml (Linux), ~/Library/Application Support/sapp/config.toml (Mac)
# or %APPDATA%\sapp\config.toml (Windows). Override the location with SAPP_CONFIG_PATH.

# Backend serving the credential endpoint (GET {backend_url}/api/livekit)
# Can also be set with SAPP_BACKEND_URL
backend_url = "http://localhost:7860"

# Basic auth password for the backend (username is empty)
# It's recommended to use the SAPP_BASIC_PASSWORD environment variable instead
# basic_password = "..."

# Milliseconds to wait before showing user transcription
debounce_ms = 200

# Completed transcript entries to keep
history_limit = 20

# Seconds before a credential request times out
request_timeout_secs = 30
"#
}

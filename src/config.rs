// AeroBucket Configuration Module
// Persistent client settings (endpoint, timeouts, upload tuning, codec mode)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::providers::{DEFAULT_PRESIGN_TTL_SECS, MAX_PRESIGN_TTL_SECS};
use crate::upload::{DEFAULT_COMPLETION_GRACE, DEFAULT_QUEUE_SIZE};

const APP_DIR: &str = "aerobucket";
const CONFIG_FILENAME: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How remembered credentials are encoded
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodecMode {
    /// base64 JSON (obfuscation only)
    #[default]
    Obfuscated,
    /// Sealed with a passphrase asked for at connect/restore time
    Passphrase,
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// S3-compatible endpoint (None = AWS)
    pub endpoint: Option<String>,
    /// Path-style addressing (MinIO and most self-hosted services)
    pub path_style: bool,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
    /// Multipart parts in flight per file (1-16, default: 4)
    pub upload_queue_size: usize,
    /// How long a finished upload stays listed at 100%
    pub completion_grace_ms: u64,
    /// Default lifetime of share links
    pub presign_ttl_secs: u64,
    pub credential_codec: CodecMode,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            path_style: false,
            request_timeout_secs: 60,
            upload_queue_size: DEFAULT_QUEUE_SIZE,
            completion_grace_ms: DEFAULT_COMPLETION_GRACE.as_millis() as u64,
            presign_ttl_secs: DEFAULT_PRESIGN_TTL_SECS,
            credential_codec: CodecMode::default(),
        }
    }
}

impl AppConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }
}

/// Clamp values to safe ranges
pub fn validate_config(config: &mut AppConfig) {
    config.upload_queue_size = config.upload_queue_size.clamp(1, 16);

    if config.request_timeout_secs == 0 {
        config.request_timeout_secs = 60;
    }

    config.presign_ttl_secs = config.presign_ttl_secs.clamp(1, MAX_PRESIGN_TTL_SECS);

    if let Some(endpoint) = config.endpoint.as_deref() {
        let trimmed = endpoint.trim();
        config.endpoint = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.trim_end_matches('/').to_string())
        };
    }
}

/// `<config_dir>/aerobucket`
pub fn app_dir() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join(APP_DIR)
}

/// Get the path to the config file
pub fn get_config_path() -> PathBuf {
    app_dir().join(CONFIG_FILENAME)
}

/// Load configuration; a missing or unreadable file yields the defaults
pub fn load_config_from(config_path: &Path) -> AppConfig {
    let mut config = if config_path.exists() {
        match fs::read_to_string(config_path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config {:?}: {}", config_path, e);
                    AppConfig::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config {:?}: {}", config_path, e);
                AppConfig::default()
            }
        }
    } else {
        AppConfig::default()
    };

    validate_config(&mut config);
    config
}

pub fn load_config() -> AppConfig {
    load_config_from(&get_config_path())
}

/// Save configuration to disk
pub fn save_config_to(config: &AppConfig, config_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path, content)?;

    tracing::info!("Config saved to {:?}", config_path);
    Ok(())
}

pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

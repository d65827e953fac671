//! Bootstrap configuration loading and resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is not fatal: the client logs a warning and starts
//! with compiled defaults. A config file that exists but does not parse is an
//! error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "CDSS_CONFIG";
/// Environment variable overriding the API base URL
pub const API_BASE_URL_ENV: &str = "CDSS_API_BASE_URL";
/// Environment variable carrying the API bearer token
pub const API_TOKEN_ENV: &str = "CDSS_API_TOKEN";

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Base URL of the clinical backend REST API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Bearer token for the REST API (optional)
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Polling reconciler bounds
    #[serde(default)]
    pub polling: PollingConfig,

    /// Volumetric decode settings
    #[serde(default)]
    pub volume: VolumeConfig,

    /// Push channel settings
    #[serde(default)]
    pub push: PushConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            logging: LoggingConfig::default(),
            polling: PollingConfig::default(),
            volume: VolumeConfig::default(),
            push: PushConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Polling reconciler bounds
///
/// Worst-case wait is roughly `max_attempts * interval_ms` plus recovery
/// waits for transient lookup errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_consecutive_errors: default_max_consecutive_errors(),
            interval_ms: default_interval_ms(),
            recovery_delay_ms: default_recovery_delay_ms(),
        }
    }
}

/// Volumetric decode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeConfig {
    /// Channel names decoded as integer class labels when the payload
    /// does not declare its own label channels
    #[serde(default = "default_label_channels")]
    pub label_channels: Vec<String>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            label_channels: default_label_channels(),
        }
    }
}

/// Push channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushConfig {
    /// Whether to open the push subscription at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    60
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_recovery_delay_ms() -> u64 {
    1000
}

fn default_label_channels() -> Vec<String> {
    vec![
        "prediction".to_string(),
        "label".to_string(),
        "segmentation".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

/// Resolve the config file path
///
/// Priority: CLI argument → `CDSS_CONFIG` → `<config_dir>/cdss/<module>.toml`
pub fn resolve_config_path(cli_arg: Option<&Path>, module_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|d| d.join("cdss").join(format!("{}.toml", module_name)))
}

/// Load TOML config, falling back to defaults when the file does not exist
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using compiled defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolve the API base URL
///
/// Priority: CLI argument → `CDSS_API_BASE_URL` → TOML → compiled default
/// (the TOML value already carries the compiled default when absent).
pub fn resolve_api_base_url(cli_arg: Option<&str>, toml_config: &TomlConfig) -> String {
    if let Some(url) = cli_arg {
        return normalize_base_url(url);
    }

    if let Ok(url) = std::env::var(API_BASE_URL_ENV) {
        if !url.trim().is_empty() {
            return normalize_base_url(&url);
        }
    }

    normalize_base_url(&toml_config.api_base_url)
}

/// Resolve the API token
///
/// Priority: `CDSS_API_TOKEN` → TOML. Blank values count as absent.
pub fn resolve_api_token(toml_config: &TomlConfig) -> Option<String> {
    let env_token = std::env::var(API_TOKEN_ENV).ok();
    let toml_token = toml_config.api_token.as_ref();

    if env_token.as_deref().is_some_and(is_valid_token) && toml_token.is_some_and(|t| is_valid_token(t)) {
        warn!("API token found in both environment and TOML. Using environment (highest priority).");
    }

    env_token
        .filter(|t| is_valid_token(t))
        .or_else(|| toml_token.filter(|t| is_valid_token(t)).cloned())
}

/// Validate token (non-empty, non-whitespace)
pub fn is_valid_token(token: &str) -> bool {
    !token.trim().is_empty()
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

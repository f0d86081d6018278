//! TOML configuration file for the gateway client.
//!
//! Looked up at an explicit path, or in the platform config directory:
//! - Windows:  `%APPDATA%\FleetLink\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/fleetlink/config.toml` (or `~/.config/...`)
//! - macOS:    `~/Library/Application Support/FleetLink/config.toml`
//!
//! ```toml
//! [gateway]
//! url = "ws://10.0.0.5:3000"
//! log_level = "debug"
//!
//! [schema]
//! min_version = 13
//! preferred_version = 21
//!
//! [session]
//! request_timeout_ms = 30000
//! max_reconnect_attempts = 10
//! ```
//!
//! # Serde default values
//!
//! Every section and every field has a default, so an empty file, a file
//! with only some sections, and no file at all are all valid.  Durations are
//! stored as integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetlink_core::protocol::validator::default_streaming_whitelist;
use fleetlink_core::{ClientSchema, ExponentialBackoff, ValidatorConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::application::client::ClientOptions;
use crate::application::execute_command::RetryPolicy;
use crate::infrastructure::network::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub schema: SchemaSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub validator: ValidatorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// WebSocket URL of the gateway.
    #[serde(default = "default_url")]
    pub url: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaSection {
    /// Oldest schema version this client can handle.
    #[serde(default = "default_min_schema")]
    pub min_version: u32,
    /// Schema version this client asks for when the gateway offers it.
    #[serde(default = "default_preferred_schema")]
    pub preferred_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Upper bound of the random extra delay, as a fraction (0.1 = 10 %).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Total attempts per command, including the first.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorSection {
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Hard ceiling for whitelisted streaming frames.
    #[serde(default = "default_max_streaming_frame_size")]
    pub max_streaming_frame_size: usize,
    #[serde(default = "default_rate_limit_messages")]
    pub rate_limit_messages: usize,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Event names whose frames may exceed `max_frame_size`.
    #[serde(default = "default_streaming_whitelist")]
    pub streaming_whitelist: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_url() -> String {
    "ws://127.0.0.1:3000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_min_schema() -> u32 {
    13
}
fn default_preferred_schema() -> u32 {
    21
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_jitter_ratio() -> f64 {
    0.1
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_max_frame_size() -> usize {
    500_000
}
fn default_max_streaming_frame_size() -> usize {
    16 * 1024 * 1024
}
fn default_rate_limit_messages() -> usize {
    100
}
fn default_rate_limit_window_ms() -> u64 {
    1_000
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_url(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SchemaSection {
    fn default() -> Self {
        Self {
            min_version: default_min_schema(),
            preferred_version: default_preferred_schema(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_streaming_frame_size: default_max_streaming_frame_size(),
            rate_limit_messages: default_rate_limit_messages(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            streaming_whitelist: default_streaming_whitelist(),
        }
    }
}

// ── Conversion to runtime settings ────────────────────────────────────────────

impl ClientConfig {
    /// Transport settings derived from the `[gateway]`, `[session]` and
    /// `[validator]` sections.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.gateway.url.clone(),
            request_timeout: Duration::from_millis(self.session.request_timeout_ms),
            reconnect_backoff: ExponentialBackoff {
                base: Duration::from_millis(self.session.reconnect_base_delay_ms),
                max: Duration::from_millis(self.session.reconnect_max_delay_ms),
                jitter_ratio: checked_jitter("session", self.session.jitter_ratio),
            },
            max_reconnect_attempts: self.session.max_reconnect_attempts,
            validator: ValidatorConfig {
                max_frame_size: self.validator.max_frame_size,
                max_streaming_frame_size: self.validator.max_streaming_frame_size,
                rate_limit_messages: self.validator.rate_limit_messages,
                rate_limit_window: Duration::from_millis(self.validator.rate_limit_window_ms),
                streaming_whitelist: self.validator.streaming_whitelist.clone(),
                ..ValidatorConfig::default()
            },
        }
    }

    /// Façade settings derived from the `[schema]` and `[retry]` sections.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            schema: ClientSchema::new(self.schema.min_version, self.schema.preferred_version),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                backoff: ExponentialBackoff {
                    base: Duration::from_millis(self.retry.base_delay_ms),
                    max: Duration::MAX,
                    jitter_ratio: checked_jitter("retry", self.retry.jitter_ratio),
                },
            },
        }
    }
}

/// Clamps a jitter ratio read from the file to `0.0..=1.0`.  NaN and
/// infinities become `0.0`.
fn checked_jitter(section: &str, ratio: f64) -> f64 {
    let checked = if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if checked != ratio {
        warn!("[{section}] jitter_ratio = {ratio} is out of range; using {checked}");
    }
    checked
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from `path`, or from the platform location when `None`.
///
/// A missing file yields [`ClientConfig::default()`].
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ClientConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("FleetLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("fleetlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("FleetLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

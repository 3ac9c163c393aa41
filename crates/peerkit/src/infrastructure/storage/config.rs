//! TOML-based configuration persistence.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\PeerKit\config.toml`
//! - Linux:    `~/.config/peerkit/config.toml`
//! - macOS:    `~/Library/Application Support/PeerKit/config.toml`
//!
//! Example:
//!
//! ```toml
//! [session]
//! service_name = "my-p2p-service"
//! invite_timeout_ms = 3000
//! probe_timeout_ms = 2000
//! log_level = "info"
//!
//! [identity]
//! peer_id = "6f1c2b9e-4a57-4c1e-9a57-2b1f0e3d8c44"
//! display_name = "alice"
//! ```
//!
//! Every field has a serde default, so a missing file, a missing section, or
//! a file written by an older version all load cleanly.  The `[identity]`
//! table is absent until the first session has been started.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerkit_core::{PeerId, PeerIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::application::session_manager::SessionSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    /// The persisted self identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityEntry>,
}

/// Session behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Service name peers advertise and browse for.  Only peers with the
    /// same name see each other.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// How long an outgoing invitation waits for an answer.
    #[serde(default = "default_invite_timeout_ms")]
    pub invite_timeout_ms: u64,
    /// How long a liveness ping waits for its pong.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Persisted self identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityEntry {
    pub peer_id: Uuid,
    pub display_name: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_service_name() -> String {
    "my-p2p-service".to_string()
}
fn default_invite_timeout_ms() -> u64 {
    3000
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            invite_timeout_ms: default_invite_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            invite_timeout: Duration::from_millis(self.invite_timeout_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

impl IdentityEntry {
    pub fn from_identity(identity: &PeerIdentity) -> Self {
        Self {
            peer_id: identity.id().as_uuid(),
            display_name: identity.display_name().to_string(),
        }
    }

    /// The stored identity as the local peer.
    pub fn to_identity(&self) -> PeerIdentity {
        PeerIdentity::with_id(PeerId::from_uuid(self.peer_id), self.display_name.clone(), true)
    }
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

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
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

/// Resolves the platform config base directory including the `PeerKit` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("PeerKit"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("peerkit"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("PeerKit")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

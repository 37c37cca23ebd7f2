//! Launcher configuration surface.
//!
//! Every option has a default so the launcher runs with an empty or absent
//! configuration file. Durations are written in human-readable form
//! (`"5s"`, `"15s"`). The verification key may be given inline as PEM or as
//! a path; the binary additionally carries a build-time default key.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Root directory of the launcher state (marker file and slots).
    pub base_path: PathBuf,

    /// URL returning the remote update metadata JSON.
    pub update_info_url: String,

    /// PEM-encoded RSA public key for manifest verification, inline.
    pub public_key_pem: Option<String>,

    /// Path to a PEM-encoded RSA public key; used when
    /// `public_key_pem` is not set.
    pub public_key_path: Option<PathBuf>,

    /// File name of the application executable inside a slot.
    pub app_executable: String,

    /// Directory for the download scratch archive; the OS temp directory
    /// when unset.
    pub scratch_dir: Option<PathBuf>,

    /// Cadence of the heartbeat liveness check.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence after which the application counts as not responding.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Timeout applied to every HTTP request.
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

fn default_base_path() -> PathBuf {
    // %LOCALAPPDATA% on Windows, XDG data dir on Unix, with a scratch
    // fallback so the launcher never fails to come up for want of a home.
    let data_root = std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
        })
        .unwrap_or_else(std::env::temp_dir);
    data_root.join("MeineFirma").join("MeineApp")
}

fn default_update_info_url() -> String {
    "http://localhost:8000/update.json".to_string()
}

fn default_app_executable() -> String {
    "MeineApp.exe".to_string()
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(15)
}

const fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            update_info_url: default_update_info_url(),
            public_key_pem: None,
            public_key_path: None,
            app_executable: default_app_executable(),
            scratch_dir: None,
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            http_timeout: default_http_timeout(),
        }
    }
}

impl LauncherConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Resolves the verification key PEM: inline value first, then the
    /// configured path, then the supplied build-time default.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if `public_key_path` is set but unreadable.
    pub fn resolve_public_key_pem(&self, build_time_default: &str) -> io::Result<String> {
        if let Some(pem) = &self.public_key_pem {
            return Ok(pem.clone());
        }
        if let Some(path) = &self.public_key_path {
            return std::fs::read_to_string(path);
        }
        Ok(build_time_default.to_string())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

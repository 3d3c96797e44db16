//! Configuration system for Cove.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $COVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cove/config.toml
//!   3. ~/.config/cove/config.toml
//!
//! Folder entries are `[[folder]]` tables; their option names and defaults
//! are part of the external configuration contract.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CovedConfig {
    pub network: NetworkConfig,
    /// One entry per synchronized folder.
    #[serde(rename = "folder")]
    pub folders: Vec<FolderParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen address for inbound peer links. Empty = don't listen.
    pub listen: String,
}

/// Per-folder parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderParams {
    /// Folder secret string (required).
    pub secret: String,
    /// User-visible synchronized root (required).
    pub path: PathBuf,
    /// Where index, chunks, and temp files live. Empty = `<path>/.cove`.
    pub system_path: Option<PathBuf>,
    /// Debounce window for filesystem events, milliseconds.
    pub index_event_timeout: u64,
    /// Periodic full walk, seconds.
    pub full_rescan_interval: u64,
    pub preserve_unix_attrib: bool,
    pub preserve_windows_attrib: bool,
    pub preserve_symlinks: bool,
    /// NFC-normalize paths before hashing.
    pub normalize_unicode: bool,
    /// Strong-hash family discriminant for chunk ct_hashes.
    pub chunk_strong_hash_type: u8,
    /// Glob patterns excluded from synchronization.
    pub ignore_paths: Vec<String>,
    /// Static peer endpoints (`host:port`), bypassing discovery.
    pub nodes: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CovedConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            folders: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "[::]:41337".to_string(),
        }
    }
}

impl Default for FolderParams {
    fn default() -> Self {
        Self {
            secret: String::new(),
            path: PathBuf::new(),
            system_path: None,
            index_event_timeout: 1000,
            full_rescan_interval: 600,
            preserve_unix_attrib: false,
            preserve_windows_attrib: false,
            preserve_symlinks: true,
            normalize_unicode: true,
            chunk_strong_hash_type: 0,
            ignore_paths: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

impl FolderParams {
    /// Resolved system path: explicit setting or `<path>/.cove`.
    pub fn system_path(&self) -> PathBuf {
        self.system_path
            .clone()
            .unwrap_or_else(|| self.path.join(".cove"))
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.index_event_timeout)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.full_rescan_interval)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cove")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("folder entry missing required option `{0}`")]
    MissingOption(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CovedConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CovedConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CovedConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply COVE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("COVE_NETWORK__LISTEN") {
            self.network.listen = v;
        }
    }

    /// `secret` and `path` are required per folder.
    fn validate(&self) -> Result<(), ConfigError> {
        for folder in &self.folders {
            if folder.secret.is_empty() {
                return Err(ConfigError::MissingOption("secret"));
            }
            if folder.path.as_os_str().is_empty() {
                return Err(ConfigError::MissingOption("path"));
            }
        }
        Ok(())
    }
}

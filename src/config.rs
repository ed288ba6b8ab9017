//! Configuration loaded from `<config dir>/vidcast/config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CasterError, Result};

/// Ports tried in order when the stream server starts.
pub const DEFAULT_PORTS: &[u16] = &[8765, 8766, 8767, 8768, 8080, 8888];

/// Environment variable overriding the conversion cache directory.
pub const CACHE_DIR_ENV: &str = "VIDCAST_CACHE_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub cast: CastConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub ports: Vec<u16>,
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.to_vec(),
            chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Overrides the platform cache directory.
    pub dir: Option<PathBuf>,
    pub max_size_mb: u64,
    pub max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size_mb: 10 * 1024,
            max_age_days: 30,
        }
    }
}

impl CacheConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 60 * 60)
    }

    /// Resolution order: `VIDCAST_CACHE_DIR`, then `dir`, then the platform cache dir.
    pub fn resolve_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("is", "8b", "vidcast")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("vidcast-cache"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CastConfig {
    pub head_timeout_secs: u64,
    pub verify_attempts: u32,
    pub verify_interval_ms: u64,
    /// 1-based attempt at which an IDLE receiver gets a second play command.
    pub nudge_attempt: u32,
    pub foreign_app_grace_ms: u64,
    pub status_refresh_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            head_timeout_secs: 5,
            verify_attempts: 10,
            verify_interval_ms: 1000,
            nudge_attempt: 4,
            foreign_app_grace_ms: 2000,
            status_refresh_interval_ms: 500,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl CastConfig {
    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn foreign_app_grace(&self) -> Duration {
        Duration::from_millis(self.foreign_app_grace_ms)
    }

    pub fn status_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.status_refresh_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub grace_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { grace_secs: 3 }
    }
}

impl DiscoveryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Config {
    /// `~/.config/vidcast/config.toml` or the platform equivalent.
    pub fn path() -> Option<PathBuf> {
        directories::ProjectDirs::from("is", "8b", "vidcast")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads the default config file; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        match Self::path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.ports.is_empty() {
            return Err(CasterError::Config("server.ports must not be empty".into()));
        }
        if self.server.chunk_size == 0 {
            return Err(CasterError::Config("server.chunk_size must be positive".into()));
        }
        if self.cast.heartbeat_interval_ms == 0 {
            return Err(CasterError::Config("cast.heartbeat_interval_ms must be positive".into()));
        }
        if self.cast.verify_attempts == 0 {
            return Err(CasterError::Config("cast.verify_attempts must be positive".into()));
        }
        Ok(())
    }
}

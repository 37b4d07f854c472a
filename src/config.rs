//! Application configuration loaded from TOML

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "KEEPSYNC_CONFIG";

const APP_DIR: &str = "keepsync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No data directory available on this platform")]
    NoDataDir,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub network: NetworkConfig,
    pub dropbox: DropboxConfig,
    pub sync: SyncConfig,
    /// Overrides `RUST_LOG` when set, e.g. "debug"
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            connect_timeout_secs: 15,
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropboxConfig {
    pub app_key: String,
    /// `None` uses the no-redirect flow where the user pastes the code
    pub redirect_uri: Option<String>,
}

impl Default for DropboxConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            redirect_uri: None,
        }
    }
}

/// Retry policy of the background sync service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (0-based): doubles from the
    /// initial backoff and is capped at the maximum
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl AppConfig {
    /// `$KEEPSYNC_CONFIG`, else `<config dir>/keepsync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Load the file at `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.paths.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or(ConfigError::NoDataDir),
        }
    }

    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.paths.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("cache")),
        }
    }

    pub fn settings_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("settings.json"))
    }

    pub fn registry_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("used_files.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[paths]
data_dir = "/tmp/keepsync-data"

[sync]
max_retries = 2
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.sync.max_retries, 2);
        assert_eq!(config.sync.initial_backoff_ms, 1_000);
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/keepsync-data"));
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/keepsync-data/cache"));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync\nmax_retries = ").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_backoff_is_capped() {
        let sync = SyncConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(sync.backoff(0), Duration::from_millis(100));
        assert_eq!(sync.backoff(2), Duration::from_millis(400));
        assert_eq!(sync.backoff(8), Duration::from_millis(1_000));
        assert_eq!(sync.backoff(60), Duration::from_millis(1_000));
    }
}

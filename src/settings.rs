//! Typed preference store shared by authenticators and key providers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;

use crate::sync::SyncStrategy;

pub const DROPBOX_AUTH_TOKEN: &str = "dropbox_auth_token";
pub const BIOMETRIC_DATA: &str = "biometric_data";
pub const DEFAULT_SYNC_STRATEGY: &str = "default_sync_strategy";
pub const DROPBOX_PENDING_VERIFIER: &str = "dropbox_pending_verifier";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value preferences. Implementations must be safe to share between
/// the I/O context and the caller.
pub trait Settings: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    /// `None` removes the key
    fn set_string(&self, key: &str, value: Option<&str>) -> Result<(), SettingsError>;

    fn dropbox_auth_token(&self) -> Option<String> {
        self.get_string(DROPBOX_AUTH_TOKEN)
    }

    fn set_dropbox_auth_token(&self, token: Option<&str>) -> Result<(), SettingsError> {
        self.set_string(DROPBOX_AUTH_TOKEN, token)
    }

    fn biometric_data(&self) -> Option<String> {
        self.get_string(BIOMETRIC_DATA)
    }

    fn set_biometric_data(&self, data: Option<&str>) -> Result<(), SettingsError> {
        self.set_string(BIOMETRIC_DATA, data)
    }

    fn default_sync_strategy(&self) -> SyncStrategy {
        self.get_string(DEFAULT_SYNC_STRATEGY)
            .and_then(|value| value.parse().ok())
            .unwrap_or(SyncStrategy::SyncAutomatically)
    }

    fn set_default_sync_strategy(&self, strategy: SyncStrategy) -> Result<(), SettingsError> {
        self.set_string(DEFAULT_SYNC_STRATEGY, Some(strategy.as_str()))
    }
}

/// Settings persisted as a flat JSON object
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileSettings {
    /// Load settings from `path`, starting empty if the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let object: HashMap<String, Value> = serde_json::from_str(&data)?;
            object
                .into_iter()
                .filter_map(|(key, value)| match value {
                    Value::String(s) => Some((key, s)),
                    Value::Null => None,
                    other => Some((key, other.to_string())),
                })
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(values)?;
        crate::fs::write_atomic(&self.path, data.as_bytes())?;
        Ok(())
    }
}

impl Settings for JsonFileSettings {
    fn get_string(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set_string(&self, key: &str, value: Option<&str>) -> Result<(), SettingsError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(v) => values.insert(key.to_string(), v.to_string()),
            None => values.remove(key),
        };
        self.save(&values)
    }
}

#[derive(Default)]
pub struct InMemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for InMemorySettings {
    fn get_string(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set_string(&self, key: &str, value: Option<&str>) -> Result<(), SettingsError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(v) => values.insert(key.to_string(), v.to_string()),
            None => values.remove(key),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_settings_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let settings = JsonFileSettings::open(&path).unwrap();
        settings.set_dropbox_auth_token(Some("token-1")).unwrap();
        settings.set_default_sync_strategy(SyncStrategy::Defer).unwrap();

        let reloaded = JsonFileSettings::open(&path).unwrap();
        assert_eq!(reloaded.dropbox_auth_token().as_deref(), Some("token-1"));
        assert_eq!(reloaded.default_sync_strategy(), SyncStrategy::Defer);

        reloaded.set_dropbox_auth_token(None).unwrap();
        let reloaded = JsonFileSettings::open(&path).unwrap();
        assert!(reloaded.dropbox_auth_token().is_none());
    }

    #[test]
    fn test_default_sync_strategy_fallback() {
        let settings = InMemorySettings::new();
        assert_eq!(settings.default_sync_strategy(), SyncStrategy::SyncAutomatically);
        settings.set_string(DEFAULT_SYNC_STRATEGY, Some("bogus")).unwrap();
        assert_eq!(settings.default_sync_strategy(), SyncStrategy::SyncAutomatically);
    }
}

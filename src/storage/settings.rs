//! Persisted Settings
//!
//! Key/value settings file holding the backend API key, and the marker file
//! recording that first-run setup has completed.
//!
//! The API key is base64-obscured on disk. This keeps it out of casual view
//! only; it is not encryption.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{ensure_dir, first_run_marker_path, settings_path};

/// Settings key under which the API key is stored
pub const API_KEY_SETTING: &str = "QueryGIS/api_key";

/// JSON key/value settings store
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl SettingsStore {
    /// Open ~/.query-gis/settings.json
    pub fn new() -> AppResult<Self> {
        Self::open(settings_path()?)
    }

    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Set a value and write the store to disk
    pub fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    pub fn remove(&self, key: &str) -> AppResult<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(values)?)?;
        Ok(())
    }

    /// Store the backend API key
    pub fn set_api_key(&self, key: &str) -> AppResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::validation("API key must not be empty"));
        }
        self.set(API_KEY_SETTING, &STANDARD.encode(key.as_bytes()))
    }

    /// Retrieve the backend API key, if one is stored
    pub fn get_api_key(&self) -> AppResult<Option<String>> {
        let Some(stored) = self.get(API_KEY_SETTING) else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(stored.trim())
            .map_err(|e| AppError::settings(format!("Stored API key is corrupt: {}", e)))?;
        let key = String::from_utf8(bytes)
            .map_err(|e| AppError::settings(format!("Stored API key is not UTF-8: {}", e)))?;
        Ok(Some(key))
    }

    /// Persist `key` if it differs from the stored one. Returns whether it
    /// was written.
    pub fn remember_api_key(&self, key: &str) -> AppResult<bool> {
        let current = self.get_api_key().unwrap_or(None);
        if current.as_deref() == Some(key.trim()) {
            return Ok(false);
        }
        self.set_api_key(key)?;
        tracing::info!("[Settings] API key updated");
        Ok(true)
    }
}

/// Marker file recording that first-run setup has completed
#[derive(Debug, Clone)]
pub struct FirstRunMarker {
    path: PathBuf,
}

impl FirstRunMarker {
    /// The marker at ~/.query-gis/.setup_complete
    pub fn new() -> AppResult<Self> {
        Ok(Self::at(first_run_marker_path()?))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_complete(&self) -> bool {
        self.path.exists()
    }

    /// Record completion with a timestamp
    pub fn mark_complete(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&self.path, chrono::Utc::now().to_rfc3339())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_obscured_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();

        store.set_api_key("  secret-key-123 ").unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret-key-123"));
        assert!(raw.contains(API_KEY_SETTING));

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(
            reopened.get_api_key().unwrap().as_deref(),
            Some("secret-key-123")
        );
    }

    #[test]
    fn test_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.get_api_key().unwrap(), None);
        assert!(store.set_api_key("   ").is_err());
    }

    #[test]
    fn test_remember_api_key_only_writes_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert!(store.remember_api_key("k1").unwrap());
        assert!(!store.remember_api_key("k1").unwrap());
        assert!(store.remember_api_key("k2").unwrap());
        assert_eq!(store.get_api_key().unwrap().as_deref(), Some("k2"));
    }

    #[test]
    fn test_corrupt_key_reports_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        store.set(API_KEY_SETTING, "!!!not-base64!!!").unwrap();
        assert!(matches!(store.get_api_key(), Err(AppError::Settings(_))));
    }

    #[test]
    fn test_first_run_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = FirstRunMarker::at(dir.path().join("q").join(".setup_complete"));
        assert!(!marker.is_complete());
        marker.mark_complete().unwrap();
        assert!(marker.is_complete());
    }
}

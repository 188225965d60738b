//! Cross-Platform Path Utilities
//!
//! Functions for resolving the QueryGIS data directory (~/.query-gis/).

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the QueryGIS directory (~/.query-gis/)
pub fn query_gis_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".query-gis"))
}

/// Get the config file path (~/.query-gis/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(query_gis_dir()?.join("config.json"))
}

/// Get the settings store path (~/.query-gis/settings.json)
pub fn settings_path() -> AppResult<PathBuf> {
    Ok(query_gis_dir()?.join("settings.json"))
}

/// Get the first-run marker path (~/.query-gis/.setup_complete)
pub fn first_run_marker_path() -> AppResult<PathBuf> {
    Ok(query_gis_dir()?.join(".setup_complete"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get the QueryGIS directory, creating if it doesn't exist
pub fn ensure_query_gis_dir() -> AppResult<PathBuf> {
    let path = query_gis_dir()?;
    ensure_dir(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_data_dir() {
        let dir = query_gis_dir().unwrap();
        assert!(dir.ends_with(".query-gis"));
        assert_eq!(config_path().unwrap().parent(), Some(dir.as_path()));
        assert_eq!(settings_path().unwrap().parent(), Some(dir.as_path()));
        assert!(first_run_marker_path()
            .unwrap()
            .ends_with(".query-gis/.setup_complete"));
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}

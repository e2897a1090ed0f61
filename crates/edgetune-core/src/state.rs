//! Persisted install state: the source of truth for rollback.
//!
//! The file exists iff an install completed. It is written once, as the last
//! step of an install, through an atomic rename, and is never partially
//! written. Rollback reads it but leaves it on disk for inspection.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::write_atomic;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("install state {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("install state {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What an install changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    pub timestamp: DateTime<Utc>,
    pub device_model: String,
    pub total_ram_mb: u64,
    pub zram_percent: u32,
    pub swapfile_path: PathBuf,
    pub swapfile_uuid: String,
    #[serde(default)]
    pub swapfile_size_mb: u64,
    #[serde(default)]
    pub swappiness: u32,
    pub api_install_dir: PathBuf,
    pub api_service_name: String,
}

impl InstallState {
    /// `true` when both records describe the same installed configuration,
    /// ignoring when it was written.
    pub fn same_install(&self, other: &InstallState) -> bool {
        let mut a = self.clone();
        a.timestamp = other.timestamp;
        a == *other
    }
}

/// Reads and writes the install state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// `path` is a host path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when no install has completed.
    pub fn load(&self) -> Result<Option<InstallState>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StateError::Json {
                path: self.path.clone(),
                source,
            })
    }

    pub fn save(&self, state: &InstallState) -> Result<(), StateError> {
        let mut json = serde_json::to_vec_pretty(state).map_err(|source| StateError::Json {
            path: self.path.clone(),
            source,
        })?;
        json.push(b'\n');
        write_atomic(&self.path, &json).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> InstallState {
        InstallState {
            timestamp: Utc::now(),
            device_model: "Raspberry Pi 4 Model B Rev 1.5".to_string(),
            total_ram_mb: 1848,
            zram_percent: 50,
            swapfile_path: PathBuf::from("/swapfile"),
            swapfile_uuid: "0f6d1a8e-3c1b-4c55-9d2e-5d9b0d1e7a11".to_string(),
            swapfile_size_mb: 2048,
            swappiness: 100,
            api_install_dir: PathBuf::from("/opt/edgetune"),
            api_service_name: "edgetune-perf".to_string(),
        }
    }

    #[test]
    fn test_missing_state_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("install-state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("var/lib/edgetune/install-state.json"));
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("install-state.json");
        fs::write(&path, "{\"timestamp\":").unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(StateError::Json { .. })
        ));
    }

    #[test]
    fn test_same_install_ignores_timestamp() {
        let a = sample_state();
        let mut b = a.clone();
        b.timestamp = a.timestamp + chrono::Duration::hours(1);
        assert!(a.same_install(&b));
        b.zram_percent = 25;
        assert!(!a.same_install(&b));
    }
}

//! Service settings store (`settings.json`).

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings corrupt: {0}")]
    Corrupt(String),
    #[error("settings write failed: {0}")]
    WriteFailed(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// Which node the service talks to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    #[default]
    Public,
    Private,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub node_mode: NodeMode,
    pub last_updated: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_mode: NodeMode::Public,
            last_updated: 0,
        }
    }
}

/// Durable store for the single settings record.
pub struct SettingsStore {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SettingsError::Corrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(SettingsError::Io(e.to_string())),
        };
        Ok(Self {
            path,
            inner: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn set_node_mode(&self, mode: NodeMode) -> Result<Settings, SettingsError> {
        let mut guard = self.inner.write();
        guard.node_mode = mode;
        guard.last_updated = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let json = serde_json::to_vec_pretty(&*guard)
            .map_err(|e| SettingsError::WriteFailed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| SettingsError::WriteFailed(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| SettingsError::WriteFailed(e.to_string()))?;
        Ok(guard.clone())
    }
}

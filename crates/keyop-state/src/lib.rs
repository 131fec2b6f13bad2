//! The small persistent key/value facility services and the bridge use
//! to remember cursors and per-service state.

use keyop_core::error::KeyopError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable, atomically-written, JSON-encoded blob store.
///
/// One value per key, stored at `<root>/<key>.json`. Writes go through
/// a temp-file-then-rename so a crash mid-write never leaves a partial
/// file behind.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KeyopError> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(KeyopError::InvalidArgument(format!(
                "invalid state key: {key:?}"
            )));
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    /// Atomically persist `value` under `key`.
    pub async fn save<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), KeyopError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(value)?;
        let tmp_path = tmp_path_for(&path);
        tokio::fs::write(&tmp_path, &encoded).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(key, bytes = encoded.len(), "state saved");
        Ok(())
    }

    /// Load the value stored under `key`. Returns
    /// [`KeyopError::NotFound`] if the key was never saved — callers
    /// typically treat that as "start fresh" and do not log it as an
    /// error.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<T, KeyopError> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyopError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| KeyopError::StorageCorrupt(format!("{key}: {e}")))
    }

    /// Best-effort existence check without decoding.
    pub async fn exists(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => tokio::fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

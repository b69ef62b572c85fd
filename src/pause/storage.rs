//! Content storage for pause-state blobs
//!
//! Blobs are addressed by slash-separated keys such as
//! `workflow_pause_states/{run_id}.json`.
//!
//! # Directory Structure
//!
//! ```text
//! {base}/
//! └── workflow_pause_states/
//!     ├── run-a.json
//!     └── run-b.json.zst
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;

/// Key/value byte storage
#[async_trait]
pub trait ContentStorage: Send + Sync {
    /// Store content under a key, replacing any previous content
    async fn save(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Load the content stored under a key
    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete a key; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Check whether a key holds content
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Process-local storage, the engine's default
#[derive(Debug, Default)]
pub struct MemoryContentStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryContentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ContentStorage for MemoryContentStorage {
    async fn save(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.lock().contains_key(key))
    }
}

/// Filesystem storage rooted at a base directory
///
/// Writes go to a temporary file that is synced and renamed into place.
#[derive(Debug, Clone)]
pub struct FileContentStorage {
    base_path: PathBuf,
    /// Whether to compress content with zstd
    compression: bool,
}

impl FileContentStorage {
    /// Create a storage rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
        }
    }

    /// Resolve a key to a path under the base directory
    fn content_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let mut path = self.base_path.join(relative);
        if self.compression {
            let mut name = path.as_os_str().to_owned();
            name.push(".zst");
            path = PathBuf::from(name);
        }
        Ok(path)
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
            .map_err(|e| StorageError::Compression(format!("init failed: {}", e)))?;
        encoder
            .write_all(data)
            .map_err(|e| StorageError::Compression(format!("write failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| StorageError::Compression(format!("finish failed: {}", e)))
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>, StorageError> {
        zstd::stream::decode_all(data).map_err(|e| StorageError::Compression(e.to_string()))
    }
}

#[async_trait]
impl ContentStorage for FileContentStorage {
    async fn save(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let final_path = self.content_path(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(key, e))?;
        }

        let data = if self.compression {
            Self::compress(content)?
        } else {
            content.to_vec()
        };

        let mut temp_name = final_path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        file.write_all(&data).await.map_err(|e| StorageError::io(key, e))?;
        file.sync_all().await.map_err(|e| StorageError::io(key, e))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.content_path(key)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(StorageError::io(key, e)),
        };
        if self.compression {
            Self::decompress(&data)
        } else {
            Ok(data)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.content_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.content_path(key)?;
        fs::try_exists(&path).await.map_err(|e| StorageError::io(key, e))
    }
}

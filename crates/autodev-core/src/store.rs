//! # Persistent Key-Value Store
//!
//! Per-entity JSON documents under a root directory. Sessions, circuit
//! breaker states, and provider status all flow through this store.
//!
//! Writes follow the atomic pattern: serialize to a sibling `.tmp` file,
//! flush, then rename over the final path. Readers therefore never observe a
//! partially written document. Every write is preceded by a free-space check
//! so a full disk surfaces as a typed error instead of a truncated file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Minimum free space required before any write is attempted.
pub const MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;

/// Errors surfaced by the state store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O failure at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Insufficient disk space: {available} bytes available, {required} required")]
    InsufficientDisk { available: u64, required: u64 },
}

impl PersistenceError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Filesystem-backed store of JSON documents.
///
/// Relative keys such as `sessions/ABC-7.json` resolve against the root
/// directory. The root is created on open with owner-only permissions.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    min_free_bytes: u64,
}

impl StateStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| PersistenceError::io(&root, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            fs::set_permissions(&root, perms)
                .await
                .map_err(|e| PersistenceError::io(&root, e))?;
        }

        Ok(Self {
            root,
            min_free_bytes: MIN_FREE_BYTES,
        })
    }

    /// Override the free-space floor; tests use this to force the
    /// insufficient-disk path without filling a disk.
    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    /// The root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative key to an absolute path under the root.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Write a document atomically under `key`.
    pub async fn write_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let path = self.path_for(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::io(parent, e))?;
        }

        self.ensure_free_space()?;

        let json = serde_json::to_string_pretty(value).map_err(|e| {
            PersistenceError::Serialization {
                message: e.to_string(),
            }
        })?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| PersistenceError::io(&temp_path, e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| PersistenceError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| PersistenceError::io(&temp_path, e))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| PersistenceError::io(&path, e))
    }

    /// Read a document from `key`, returning `None` when absent.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, PersistenceError> {
        let path = self.path_for(key);

        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| PersistenceError::Serialization {
                message: format!("{}: {}", path.display(), e),
            })
    }

    /// Whether a document exists under `key`.
    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Delete the document under `key`. Returns whether a file was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, PersistenceError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }

    /// List the file stems of `.json` documents directly under `dir`.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>, PersistenceError> {
        let path = self.path_for(dir);
        let mut stems = Vec::new();

        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stems),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PersistenceError::io(&path, e))?
        {
            let entry_path = entry.path();
            if entry_path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) {
                    stems.push(stem.to_string());
                }
            }
        }

        stems.sort();
        Ok(stems)
    }

    fn ensure_free_space(&self) -> Result<(), PersistenceError> {
        let available = fs2::available_space(&self.root).map_err(|e| PersistenceError::Io {
            path: self.root.display().to_string(),
            message: e.to_string(),
        })?;

        if available < self.min_free_bytes {
            return Err(PersistenceError::InsufficientDisk {
                available,
                required: self.min_free_bytes,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

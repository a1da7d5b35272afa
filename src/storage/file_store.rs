//! Atomic JSON file store (the primary store).
//!
//! Every document lives in its own file under a root directory. Writes go to
//! `<path>.tmp` first and are committed by renaming over the target, so a
//! reader never observes a partial file and a crash mid-write leaves the
//! previously committed version intact.
//!
//! # Example
//!
//! ```rust,no_run
//! use state_engine::storage::AtomicFileStore;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), state_engine::EngineError> {
//! let store = AtomicFileStore::new("./data");
//! store.write("players/42.json".as_ref(), &json!({"points": 10})).await?;
//! let value: Option<serde_json::Value> = store.read("players/42.json".as_ref()).await?;
//! assert_eq!(value.unwrap()["points"], 10);
//! # Ok(())
//! # }
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::record::now_millis;

const TEMP_SUFFIX: &str = ".tmp";

pub struct AtomicFileStore {
    root: PathBuf,
}

impl AtomicFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a path relative to the root.
    #[must_use]
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Read and decode a document.
    ///
    /// Returns `Ok(None)` when the file does not exist and
    /// `Err(CorruptState)` when it exists but cannot be decoded.
    pub async fn read<T: DeserializeOwned>(&self, relative: &Path) -> Result<Option<T>> {
        let path = self.resolve(relative);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::io(path, e)),
        };
        crate::metrics::record_bytes_read(bytes.len());

        if bytes.is_empty() {
            return Err(EngineError::CorruptState {
                path,
                reason: "empty file".into(),
            });
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EngineError::CorruptState {
                path,
                reason: e.to_string(),
            })
    }

    /// Read a document, moving a corrupt file aside and reporting it as absent.
    pub async fn read_or_quarantine<T: DeserializeOwned>(&self, relative: &Path) -> Result<Option<T>> {
        match self.read(relative).await {
            Err(EngineError::CorruptState { path, reason }) => {
                let moved = self.quarantine(relative).await?;
                warn!(
                    path = %path.display(),
                    quarantined = %moved.display(),
                    reason = %reason,
                    "Corrupt document quarantined, rebuilding"
                );
                Ok(None)
            }
            other => other,
        }
    }

    /// Serialize and atomically replace a document.
    pub async fn write<T: Serialize + ?Sized>(&self, relative: &Path, value: &T) -> Result<()> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(parent, e))?;
        }

        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp_path = temp_path_for(&path);

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| EngineError::io(&tmp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| EngineError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::io(&tmp_path, e))?;
        drop(file);

        // Commit point
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(EngineError::io(&path, e));
        }

        crate::metrics::record_bytes_written(bytes.len());
        debug!(path = %path.display(), bytes = bytes.len(), "Document committed");
        Ok(())
    }

    /// Delete a document. Returns whether it existed.
    pub async fn remove(&self, relative: &Path) -> Result<bool> {
        let path = self.resolve(relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    /// Rename a damaged file to `<path>.corrupt-<epoch_millis>`.
    pub async fn quarantine(&self, relative: &Path) -> Result<PathBuf> {
        let path = self.resolve(relative);
        let mut name = path.file_name().map(OsString::from).unwrap_or_default();
        name.push(format!(".corrupt-{}", now_millis()));
        let target = path.with_file_name(name);

        tokio::fs::rename(&path, &target)
            .await
            .map_err(|e| EngineError::io(&path, e))?;
        crate::metrics::record_quarantine();
        Ok(target)
    }

    /// Ids (file stems) of the JSON documents in a directory.
    pub async fn list_ids(&self, relative_dir: &Path) -> Result<Vec<String>> {
        let dir = self.resolve(relative_dir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::io(dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| EngineError::io(&dir, e))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove temp files orphaned by a crash between write and rename.
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(EngineError::io(dir, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| EngineError::io(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| EngineError::io(&path, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| EngineError::io(&path, e))?;
                    warn!(path = %path.display(), "Removed orphaned temp file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

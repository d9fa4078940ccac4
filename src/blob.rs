//! Blob storage for raw and cleaned profile payloads.
//!
//! Keys are `/`-separated relative paths such as
//! `profiles/urn-li-123-1760000000-raw.json`.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Invalid blob key '{0}'")]
    InvalidKey(String),

    #[error("Failed to write blob '{key}': {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob upload failed: {0}")]
    Upload(String),
}

/// Destination for fetched payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError>;
}

/// Storage keys for one successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobKeys {
    pub raw: String,
    pub cleaned: String,
}

impl BlobKeys {
    /// `profiles/{identifier}-{unix_seconds}-raw.json` and its `-cleaned.json` sibling.
    ///
    /// Characters that would split the key into path segments are replaced.
    pub fn for_fetch(identifier: &str, fetched_at: DateTime<Utc>) -> Self {
        let slug: String = identifier
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '-',
                c if c.is_control() => '-',
                c => c,
            })
            .collect();
        let stamp = fetched_at.timestamp();
        Self {
            raw: format!("profiles/{}-{}-raw.json", slug, stamp),
            cleaned: format!("profiles/{}-{}-cleaned.json", slug, stamp),
        }
    }
}

/// Filesystem-backed store rooted at a directory.
///
/// Each object is written to a temp file in its target directory and renamed
/// into place, so readers never observe a partial payload.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.profile-harvester/blobs`, or `root_dir` from the config.
    pub fn from_config(root_dir: Option<&str>) -> Result<Self, BlobError> {
        let root = match root_dir {
            Some(dir) => crate::db::expand_home(dir)
                .map_err(|e| BlobError::Upload(format!("Cannot resolve blob root: {}", e)))?,
            None => dirs::home_dir()
                .ok_or_else(|| BlobError::Upload("Home directory not found".to_string()))?
                .join(".profile-harvester")
                .join("blobs"),
        };
        Ok(Self::new(root))
    }

    /// Resolve a key below the root, rejecting anything that could escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn write_atomic(path: &Path, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
    let write_err = |source| BlobError::Write {
        key: key.to_string(),
        source,
    };
    let dir = path
        .parent()
        .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?;
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        let len = bytes.len();
        tokio::task::spawn_blocking(move || write_atomic(&path, &owned_key, &bytes))
            .await
            .map_err(|e| BlobError::Upload(format!("Blob writer task failed: {}", e)))??;
        log::debug!("Stored blob {} ({} bytes)", key, len);
        Ok(())
    }
}

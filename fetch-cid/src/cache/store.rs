//! Key-addressed disk store
//!
//! One file per key inside the cache directory, holding the raw content
//! bytes with no header or sidecar. Entries never expire; they live until
//! [`DiskStore::delete`] removes them.
//!
//! ## Key mapping
//!
//! A key becomes a file name by replacing path separators (`/` and `\`)
//! with `_`. Two keys that differ only in those characters therefore map
//! to the same file. CIDs never contain separators, so this only matters
//! for callers using the store with their own keys.

use crate::cache::config::CacheConfig;
use crate::cache::finish::OnFinishExt;
use crate::cache::types::{ByteStream, Chunk};
use crate::error::{FetchError, Result};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, trace, warn};

const PARTIAL_SUFFIX: &str = ".partial";

/// Disk-backed key/value store whose values are byte streams
#[derive(Debug, Clone)]
pub struct DiskStore {
    base_dir: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at `base_dir`
    ///
    /// The directory is created lazily by the first [`DiskStore::set`].
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        info!("Initializing disk store at {:?}", base_dir);
        Self { base_dir }
    }

    /// Create a store from a cache configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.cache_dir.clone())
    }

    /// Directory holding the cache files
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// File name used for `key`
    pub fn file_name(key: &str) -> String {
        key.replace(['/', '\\'], "_")
    }

    /// Path of the file backing `key`
    ///
    /// Fails for keys whose file name would resolve to the cache directory
    /// itself or its parent.
    pub fn key_path(&self, key: &str) -> Result<PathBuf> {
        let name = Self::file_name(key);
        if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
            return Err(FetchError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(name))
    }

    /// Open the entry for `key` as a stream
    ///
    /// Returns `Ok(None)` when there is no entry. The file handle is closed
    /// as soon as the stream reaches its end or is dropped.
    pub async fn get(&self, key: &str) -> Result<Option<ByteStream>> {
        let path = self.key_path(key)?;

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache miss: {}", key);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        debug!("Cache hit: {}", key);
        let key = key.to_string();
        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(FetchError::from))
            .on_finish(move || trace!("Released cache file for {}", key));

        Ok(Some(stream.boxed()))
    }

    /// Whether an entry exists for `key`
    pub async fn has(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key)?;

        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist `stream` as the entry for `key`, replacing any previous entry
    ///
    /// Chunks are written in the order received into a temporary file next
    /// to the final one, which is renamed into place only after the stream
    /// ended cleanly. If the stream yields an error or a write fails, the
    /// temporary file is removed and the previous entry (if any) is kept.
    ///
    /// Returns the number of bytes written.
    pub async fn set<S>(&self, key: &str, stream: S) -> Result<u64>
    where
        S: Stream<Item = Chunk>,
    {
        let path = self.key_path(key)?;
        fs::create_dir_all(&self.base_dir).await?;

        let partial = self.partial_path();
        let file = File::create(&partial).await?;

        let written = match copy_into(file, stream).await {
            Ok(written) => written,
            Err(err) => {
                warn!("Discarding partial cache entry for {}: {}", key, err);
                discard(&partial).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&partial, &path).await {
            warn!("Could not move cache entry for {} into place: {}", key, err);
            discard(&partial).await;
            return Err(err.into());
        }

        debug!("Stored cache entry {} ({} bytes)", key, written);
        Ok(written)
    }

    /// Remove the entry for `key`
    ///
    /// Fails with a not-found I/O error if there is no such entry.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path).await?;
        debug!("Removed cache entry: {}", key);
        Ok(())
    }

    /// Fresh temporary path next to the entries
    ///
    /// Named from a uuid alone so its length does not depend on the key.
    fn partial_path(&self) -> PathBuf {
        let name = format!(".{}{}", uuid::Uuid::new_v4().simple(), PARTIAL_SUFFIX);
        self.base_dir.join(name)
    }
}

/// Remove a temporary file left by a failed write
async fn discard(partial: &Path) {
    if let Err(err) = fs::remove_file(partial).await {
        warn!("Could not remove {:?}: {}", partial, err);
    }
}

/// Write every chunk of `stream` to `file`; the handle is closed on return
async fn copy_into<S>(mut file: File, stream: S) -> Result<u64>
where
    S: Stream<Item = Chunk>,
{
    let mut stream = std::pin::pin!(stream);
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

//! Append-only file cache.
//!
//! Items are encoded as one JSON document per line and buffered per partition.
//! A partition is flushed to disk once its buffer reaches the byte threshold, or
//! when [`FileCache::force_sync`] is called.
//!
//! Partition keys map onto the directory tree: `["huya", "12345", "2024-05-01"]`
//! is written to `<base>/huya/12345/2024-05-01.jsonl`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};

/// Default flush threshold (10 KiB).
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10 * 1024;

/// File extension used for partition files.
const PARTITION_EXTENSION: &str = "jsonl";

/// Durable append-only sink keyed by a set of partition keys.
#[async_trait]
pub trait FileCache<T: ?Sized + Sync>: Send + Sync {
    /// Append a single item to the partition named by `keys`.
    ///
    /// Implementations may buffer; the item is only guaranteed durable after
    /// a subsequent [`force_sync`](Self::force_sync).
    async fn append(&self, item: &T, keys: &[String]) -> Result<()>;

    /// Write out every buffered item and sync the underlying files.
    async fn force_sync(&self) -> Result<()>;
}

/// Buffered state for a single partition file.
#[derive(Debug, Default)]
struct PartitionBuffer {
    /// Encoded lines not yet written.
    pending: Vec<u8>,
    /// Whether bytes were written since the last sync.
    dirty: bool,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCacheStats {
    /// Items accepted by `append`.
    pub items_appended: u64,
    /// Bytes physically written to disk.
    pub bytes_written: u64,
    /// Number of physical writes performed.
    pub physical_writes: u64,
}

/// JSON-lines file cache with a byte-size flush threshold.
pub struct JsonFileCache {
    base_dir: PathBuf,
    flush_threshold: usize,
    partitions: Mutex<HashMap<PathBuf, PartitionBuffer>>,
    closed: AtomicBool,
    items_appended: AtomicU64,
    bytes_written: AtomicU64,
    physical_writes: AtomicU64,
}

impl JsonFileCache {
    /// Create a cache rooted at `base_dir` with the default 10 KiB threshold.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_threshold(base_dir, DEFAULT_FLUSH_THRESHOLD)
    }

    /// Create a cache with a custom flush threshold in bytes.
    ///
    /// A threshold of zero writes every append straight through.
    pub fn with_threshold(base_dir: impl Into<PathBuf>, flush_threshold: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            flush_threshold,
            partitions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            items_appended: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            physical_writes: AtomicU64::new(0),
        }
    }

    /// Root directory of the cache.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Configured flush threshold in bytes.
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Resolve the file a set of partition keys maps to.
    pub fn partition_path(&self, keys: &[String]) -> Result<PathBuf> {
        let Some((last, dirs)) = keys.split_last() else {
            return Err(CacheError::invalid_partition(keys, "at least one key is required"));
        };

        let mut path = self.base_dir.clone();
        for key in keys {
            validate_key(keys, key)?;
        }
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{last}.{PARTITION_EXTENSION}"));
        Ok(path)
    }

    /// Number of bytes buffered and not yet written.
    pub async fn pending_bytes(&self) -> usize {
        let partitions = self.partitions.lock().await;
        partitions.values().map(|p| p.pending.len()).sum()
    }

    /// Current counters.
    pub fn stats(&self) -> FileCacheStats {
        FileCacheStats {
            items_appended: self.items_appended.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            physical_writes: self.physical_writes.load(Ordering::Relaxed),
        }
    }

    /// Whether the cache has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sync everything and refuse further appends.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.sync_all().await?;
        debug!(base_dir = %self.base_dir.display(), "File cache closed");
        Ok(())
    }

    async fn append_encoded(&self, line: Vec<u8>, keys: &[String]) -> Result<()> {
        let path = self.partition_path(keys)?;

        // Held across the write so chunks of one partition land in order.
        let mut partitions = self.partitions.lock().await;
        // Checked under the lock: once close has set the flag, its sync is
        // the last one to take the buffers.
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        let buffer = partitions.entry(path.clone()).or_default();
        buffer.pending.extend_from_slice(&line);
        self.items_appended.fetch_add(1, Ordering::Relaxed);

        if buffer.pending.len() >= self.flush_threshold {
            trace!(
                path = %path.display(),
                bytes = buffer.pending.len(),
                "Flush threshold reached"
            );
            self.write_partition(&path, buffer, false).await?;
        }
        Ok(())
    }

    async fn sync_all(&self) -> Result<()> {
        let mut partitions = self.partitions.lock().await;
        for (path, buffer) in partitions.iter_mut() {
            if buffer.pending.is_empty() && !buffer.dirty {
                continue;
            }
            self.write_partition(path, buffer, true).await?;
        }
        Ok(())
    }

    async fn write_partition(
        &self,
        path: &Path,
        buffer: &mut PartitionBuffer,
        sync: bool,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        if !buffer.pending.is_empty() {
            file.write_all(&buffer.pending).await?;
            file.flush().await?;
            self.bytes_written
                .fetch_add(buffer.pending.len() as u64, Ordering::Relaxed);
            self.physical_writes.fetch_add(1, Ordering::Relaxed);
            buffer.pending.clear();
            buffer.dirty = true;
        }

        if sync {
            file.sync_all().await?;
            buffer.dirty = false;
        }
        Ok(())
    }
}

#[async_trait]
impl<T> FileCache<T> for JsonFileCache
where
    T: Serialize + Sync,
{
    async fn append(&self, item: &T, keys: &[String]) -> Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        self.append_encoded(line, keys).await
    }

    async fn force_sync(&self) -> Result<()> {
        self.sync_all().await
    }
}

fn validate_key(keys: &[String], key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_partition(keys, "empty key"));
    }
    if key == "." || key == ".." {
        return Err(CacheError::invalid_partition(keys, "relative path component"));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(CacheError::invalid_partition(keys, "path separator in key"));
    }
    Ok(())
}

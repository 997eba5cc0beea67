//! Plugin owning the shared barrage file cache.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use barrage_cache::{Barrage, DEFAULT_FLUSH_THRESHOLD, JsonFileCache};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::pipeline::IngestPipeline;
use crate::Result;
use crate::plugin::Plugin;

/// File cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    /// Buffered bytes per partition before a physical write.
    pub flush_threshold_bytes: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Owns the [`JsonFileCache`] every pipeline writes through.
pub struct FileCachePlugin {
    cache: Arc<JsonFileCache>,
}

impl FileCachePlugin {
    pub fn new(base_dir: impl Into<PathBuf>, config: &FileCacheConfig) -> Self {
        Self {
            cache: Arc::new(JsonFileCache::with_threshold(
                base_dir,
                config.flush_threshold_bytes,
            )),
        }
    }

    pub fn cache(&self) -> Arc<JsonFileCache> {
        self.cache.clone()
    }

    /// A fresh pipeline draining into this cache.
    pub fn pipeline(&self) -> IngestPipeline<Barrage> {
        IngestPipeline::<Barrage>::new(self.cache.clone())
    }
}

#[async_trait]
impl Plugin for FileCachePlugin {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.cache.base_dir()).await?;
        debug!(base_dir = %self.cache.base_dir().display(), "File cache directory ready");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cache.close().await?;
        let stats = self.cache.stats();
        info!(
            items = stats.items_appended,
            bytes = stats.bytes_written,
            writes = stats.physical_writes,
            "File cache flushed"
        );
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

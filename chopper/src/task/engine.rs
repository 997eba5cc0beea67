//! Crawl execution boundary.

use std::sync::Arc;

use async_trait::async_trait;
use barrage_cache::Barrage;
use tokio_util::sync::CancellationToken;

use super::request::TaskConfig;
use crate::Result;
use crate::ingest::IngestPipeline;

/// Performs the actual crawl for a task.
///
/// Implementations push result batches into `sink` with
/// [`IngestPipeline::process`], from as many workers as they like, and must
/// only return once every worker has stopped submitting. `cancel` fires on
/// shutdown.
#[async_trait]
pub trait CrawlEngine: Send + Sync + 'static {
    async fn crawl(
        &self,
        config: &TaskConfig,
        sink: Arc<IngestPipeline<Barrage>>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

//! Ingestion of crawled items into durable storage.

mod file_cache;
mod pipeline;

pub use file_cache::{FileCacheConfig, FileCachePlugin};
pub use pipeline::{IngestPipeline, PipelineState};

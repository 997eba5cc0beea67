//! Crawl task intake, bookkeeping and dispatch.

mod center;
mod engine;
mod record;
mod request;

pub use center::{TaskCenter, TaskCenterConfig};
pub use engine::CrawlEngine;
pub use record::{TaskRecord, TaskStatus};
pub use request::{CompletionCallback, CrawlRequest, TaskConfig, TaskOutcome};

//! Barrage cache: live chat records and their durable sink.
//!
//! This crate provides the item model produced by barrage (danmu/弹幕) crawls
//! and the append-only storage those items are drained into.
//!
//! ## Core Types
//!
//! - [`Barrage`] - A single chat line, ordered by send time
//!
//! ## Storage
//!
//! - [`FileCache`] - Append-only sink keyed by partition keys
//! - [`JsonFileCache`] - JSON-lines implementation with a byte-size flush threshold

pub mod cache;
pub mod error;
pub mod message;

pub use cache::{DEFAULT_FLUSH_THRESHOLD, FileCache, FileCacheStats, JsonFileCache};
pub use error::{CacheError, Result};
pub use message::Barrage;

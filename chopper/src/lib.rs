//! chopper library crate.
//!
//! Orchestration core for long-running barrage crawl tasks:
//!
//! - [`plugin`] - dependency-ordered plugin lifecycle management
//! - [`monitor`] - per-task periodic health monitoring
//! - [`task`] - crawl request intake and dispatch
//! - [`ingest`] - concurrent batched drain into durable storage
//! - [`services`] - the root container wiring everything together

pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod monitor;
pub mod plugin;
pub mod services;
pub mod task;

pub use error::{Error, Result};

//! Crawl requests and their outcomes.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::monitor::MonitorFactory;

/// What to crawl.
#[derive(Clone)]
pub struct TaskConfig {
    /// Platform name, e.g. "huya".
    pub platform: String,
    /// Room or channel id on the platform.
    pub room_id: String,
    /// Engine-specific options.
    pub options: HashMap<String, String>,
    /// Monitor for this task type, if it declares one.
    pub monitor: Option<MonitorFactory>,
    partition_keys: Option<Vec<String>>,
}

impl TaskConfig {
    pub fn new(platform: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            room_id: room_id.into(),
            options: HashMap::new(),
            monitor: None,
            partition_keys: None,
        }
    }

    pub fn with_monitor(mut self, factory: MonitorFactory) -> Self {
        self.monitor = Some(factory);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Override where the drained items are stored.
    pub fn with_partition_keys(mut self, keys: Vec<String>) -> Self {
        self.partition_keys = Some(keys);
        self
    }

    /// Identity shared by every request for the same room.
    pub fn task_id(&self) -> String {
        format!("{}-{}", self.platform, self.room_id)
    }

    /// Partition keys for the file cache; `[platform, room_id]` by default.
    pub fn partition_keys(&self) -> Vec<String> {
        self.partition_keys
            .clone()
            .unwrap_or_else(|| vec![self.platform.clone(), self.room_id.clone()])
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("platform", &self.platform)
            .field("room_id", &self.room_id)
            .field("options", &self.options)
            .field("monitor", &self.monitor.is_some())
            .field("partition_keys", &self.partition_keys)
            .finish()
    }
}

/// Result of one crawl run, handed to the request's callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub run_id: Uuid,
    pub items_written: usize,
    /// `Err` carries the failure message.
    pub result: std::result::Result<(), String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().err().map(String::as_str)
    }
}

/// Called once with the outcome of an accepted request.
pub type CompletionCallback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

/// A task configuration plus its completion callback.
pub struct CrawlRequest {
    pub config: TaskConfig,
    pub callback: CompletionCallback,
}

impl CrawlRequest {
    pub fn new<F>(config: TaskConfig, callback: F) -> Self
    where
        F: FnOnce(TaskOutcome) + Send + 'static,
    {
        Self {
            config,
            callback: Box::new(callback),
        }
    }

    /// A request whose outcome is only logged.
    pub fn detached(config: TaskConfig) -> Self {
        Self::new(config, |_| {})
    }
}

impl fmt::Debug for CrawlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlRequest")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

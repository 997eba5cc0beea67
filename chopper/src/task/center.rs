//! Task center: crawl request intake and dispatch.
//!
//! Each accepted request runs as one tracked task:
//! wait for a crawl slot, start the task's monitor, let the engine fill a
//! fresh pipeline, drain it into the file cache, close the monitor, then
//! report the outcome through the request's callback.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use barrage_cache::{Barrage, JsonFileCache};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::CrawlEngine;
use super::record::TaskRecord;
use super::request::{CrawlRequest, TaskConfig, TaskOutcome};
use crate::ingest::IngestPipeline;
use crate::monitor::MonitorScheduler;
use crate::plugin::Plugin;
use crate::{Error, Result};

/// Default number of crawls allowed to run at once.
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 8;

/// Default time to wait for in-flight crawls on shutdown (30 seconds).
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Task center configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCenterConfig {
    pub max_concurrent_tasks: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for TaskCenterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl TaskCenterConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Accepts crawl requests and runs them on the crawl engine.
pub struct TaskCenter {
    config: TaskCenterConfig,
    engine: Arc<dyn CrawlEngine>,
    cache: Arc<JsonFileCache>,
    monitors: Arc<MonitorScheduler>,
    records: Arc<DashMap<String, TaskRecord>>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskCenter {
    pub fn new(
        config: TaskCenterConfig,
        engine: Arc<dyn CrawlEngine>,
        cache: Arc<JsonFileCache>,
        monitors: Arc<MonitorScheduler>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            config,
            engine,
            cache,
            monitors,
            records: Arc::new(DashMap::new()),
            slots,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Accept a crawl request and dispatch it. Returns the task id.
    ///
    /// Rejected with `TaskAlreadyRunning` while a run for the same task id is
    /// queued or in progress, and with `ShuttingDown` after shutdown began.
    /// The callback of a rejected request is never invoked.
    pub fn request(&self, request: CrawlRequest) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let CrawlRequest { config, callback } = request;
        let task_id = config.task_id();

        let run_id = match self.records.entry(task_id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.requeue()?;
                record.run_id
            }
            Entry::Vacant(entry) => entry.insert(TaskRecord::new(task_id.clone())).run_id,
        };

        self.monitors.register(&task_id, config.monitor.clone());

        let run = TaskRun {
            task_id: task_id.clone(),
            run_id,
            config,
            engine: self.engine.clone(),
            cache: self.cache.clone(),
            monitors: self.monitors.clone(),
            records: self.records.clone(),
            slots: self.slots.clone(),
            cancel: self.cancel.child_token(),
        };

        self.tracker.spawn(async move {
            let outcome = run.execute().await;
            callback(outcome);
        });

        info!(task_id = %task_id, run_id = %run_id, "Crawl request accepted");
        Ok(task_id)
    }

    /// Snapshot of a task's record.
    pub fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Number of queued or running tasks.
    pub fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status.is_active())
            .count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting requests, signal running crawls and wait for them to
    /// drain, up to `timeout`. Returns whether every task finished in time.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        info!(
            active = self.active_count(),
            "Shutting down task center (timeout: {:?})", timeout
        );
        self.cancel.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("Task center stopped");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "Shutdown timeout reached, abandoning running crawls"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Plugin for TaskCenter {
    async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(self.config.shutdown_timeout()).await;
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Everything one dispatched run needs, detached from the center.
struct TaskRun {
    task_id: String,
    run_id: Uuid,
    config: TaskConfig,
    engine: Arc<dyn CrawlEngine>,
    cache: Arc<JsonFileCache>,
    monitors: Arc<MonitorScheduler>,
    records: Arc<DashMap<String, TaskRecord>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl TaskRun {
    async fn execute(self) -> TaskOutcome {
        let (items_written, result) = self.crawl_and_drain().await;
        let error = result.err().map(|e| e.to_string());

        // Covers runs that never built their monitor: cancelled before a
        // slot, or a failed factory.
        if !self.monitors.close(&self.task_id) {
            self.monitors.unregister(&self.task_id);
        }

        if let Some(mut record) = self.records.get_mut(&self.task_id) {
            record.finish(items_written, error.clone());
        }

        match &error {
            None => info!(
                task_id = %self.task_id,
                run_id = %self.run_id,
                items_written,
                "Crawl completed"
            ),
            Some(e) => error!(
                task_id = %self.task_id,
                run_id = %self.run_id,
                items_written,
                error = %e,
                "Crawl failed"
            ),
        }

        TaskOutcome {
            task_id: self.task_id,
            run_id: self.run_id,
            items_written,
            result: error.map_or(Ok(()), Err),
        }
    }

    async fn crawl_and_drain(&self) -> (usize, Result<()>) {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return (0, Err(Error::ShuttingDown)),
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return (0, Err(Error::ShuttingDown)),
            },
        };

        if let Some(mut record) = self.records.get_mut(&self.task_id)
            && let Err(e) = record.mark_running()
        {
            return (0, Err(e));
        }

        if !self.monitors.start(&self.task_id) {
            debug!(task_id = %self.task_id, "Crawling without a monitor");
        }

        let pipeline = Arc::new(IngestPipeline::<Barrage>::new(self.cache.clone()));
        let crawled = self
            .engine
            .crawl(&self.config, pipeline.clone(), self.cancel.clone())
            .await;

        // Whatever was collected is flushed, even if the crawl failed.
        let drained = pipeline
            .drain_and_flush(&self.config.partition_keys())
            .await;

        let items_written = pipeline.written_count();
        let result = crawled.and(drained.map(|_| ()));
        (items_written, result)
    }
}

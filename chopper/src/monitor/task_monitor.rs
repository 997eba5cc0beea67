//! Per-task monitor capability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// Periodic health check bound to one task.
#[async_trait]
pub trait TaskMonitor: Send + Sync + 'static {
    /// One health-check pass. Runs on the scheduler pool at a fixed period.
    ///
    /// The future may be dropped at any await point when the task is closed.
    async fn monitor(&self);

    /// Pause signal for the monitor's own logic. Returns whether the monitor
    /// acknowledged it.
    fn stop(&self) -> bool;
}

/// Builds the monitor for a task id.
pub type MonitorFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn TaskMonitor>> + Send + Sync>;

/// Wrap a closure as a [`MonitorFactory`].
pub fn monitor_factory<F>(f: F) -> MonitorFactory
where
    F: Fn(&str) -> Result<Arc<dyn TaskMonitor>> + Send + Sync + 'static,
{
    Arc::new(f)
}

//! Plugins backed by a background loop.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::Plugin;
use crate::Result;

/// Default pause between two ticks.
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(5);

/// Unit of work run repeatedly by a [`GuardPlugin`].
#[async_trait]
pub trait GuardTask: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// One iteration of the loop. Errors are logged and the loop continues.
    async fn tick(&self) -> Result<()>;

    /// Pause after each tick.
    fn idle_interval(&self) -> Duration {
        DEFAULT_IDLE_INTERVAL
    }

    /// Called once after the loop has exited.
    async fn on_shutdown(&self) {}
}

/// Adapts a [`GuardTask`] into a plugin whose `start` spawns the tick loop
/// and whose `shutdown` stops it.
pub struct GuardPlugin<G: GuardTask> {
    task: Arc<G>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    ticks: Arc<AtomicU64>,
}

impl<G: GuardTask> GuardPlugin<G> {
    pub fn new(task: G) -> Self {
        Self::from_arc(Arc::new(task))
    }

    pub fn from_arc(task: Arc<G>) -> Self {
        Self {
            task,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn task(&self) -> &Arc<G> {
        &self.task
    }

    /// Number of completed ticks, failed ones included.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[async_trait]
impl<G: GuardTask> Plugin for GuardPlugin<G> {
    async fn start(&self) -> Result<()> {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return Ok(());
        }

        let task = self.task.clone();
        let cancel = self.cancel.clone();
        let ticks = self.ticks.clone();

        *slot = Some(tokio::spawn(async move {
            debug!(guard = task.name(), "Guard loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = task.tick() => {
                        ticks.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = result {
                            warn!(guard = task.name(), error = %e, "Guard tick failed");
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(task.idle_interval()) => {}
                }
            }
            debug!(guard = task.name(), "Guard loop stopped");
        }));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(guard = self.task.name(), error = %e, "Guard loop ended abnormally");
        }
        self.task.on_shutdown().await;
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

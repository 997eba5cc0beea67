//! Per-task monitor scheduler.
//!
//! Each task id owns one registry entry holding its monitor factory, the
//! lazily built monitor instance and the cancellable schedule that invokes
//! `monitor()` with a fixed delay. Every check-then-act sequence on an entry
//! runs under the entry's map shard lock, so `start` and `close` on the same
//! task id never interleave.
//!
//! Firings share one bounded pool: a permit is held for the duration of each
//! `monitor()` call.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::events::{MonitorEvent, MonitorEventBroadcaster};
use super::task_monitor::{MonitorFactory, TaskMonitor};
use crate::Result;
use crate::plugin::Plugin;

/// Default delay between two firings (1 second).
const DEFAULT_PERIOD_MS: u64 = 1000;

/// Default number of monitors allowed to run at once.
const DEFAULT_MAX_CONCURRENT: usize = 20;

/// Monitor scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSchedulerConfig {
    /// Delay between the end of one `monitor()` call and the next, in milliseconds.
    pub period_ms: u64,
    /// Delay before the first firing, in milliseconds.
    pub initial_delay_ms: u64,
    /// Size of the shared worker pool.
    pub max_concurrent: usize,
}

impl Default for MonitorSchedulerConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            initial_delay_ms: 0,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl MonitorSchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

struct ScheduleHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Signal the loop and interrupt an in-flight `monitor()` call.
    fn cancel(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

#[derive(Default)]
struct MonitorEntry {
    factory: Option<MonitorFactory>,
    instance: Option<Arc<dyn TaskMonitor>>,
    schedule: Option<ScheduleHandle>,
}

/// Registry of per-task monitors and their schedules.
pub struct MonitorScheduler {
    config: MonitorSchedulerConfig,
    entries: DashMap<String, MonitorEntry>,
    pool: Arc<Semaphore>,
    events: MonitorEventBroadcaster,
    firings: Arc<AtomicU64>,
}

impl MonitorScheduler {
    pub fn new() -> Self {
        Self::with_config(MonitorSchedulerConfig::default())
    }

    pub fn with_config(config: MonitorSchedulerConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            entries: DashMap::new(),
            pool,
            events: MonitorEventBroadcaster::new(),
            firings: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &MonitorSchedulerConfig {
        &self.config
    }

    /// Bind a task to its monitor factory.
    ///
    /// A task without a factory is logged and left unmonitored; this never
    /// fails the caller. Registering again replaces the factory but keeps a
    /// live instance.
    pub fn register(&self, task_id: &str, factory: Option<MonitorFactory>) {
        let Some(factory) = factory else {
            warn!(task_id = %task_id, "Task has no monitor configured");
            return;
        };
        self.entries
            .entry(task_id.to_string())
            .or_default()
            .factory = Some(factory);
        debug!(task_id = %task_id, "Monitor registered");
    }

    /// Schedule the task's monitor, building it first if needed.
    ///
    /// Returns `true` if the task is (now) scheduled, including when it
    /// already was. Returns `false` if no monitor is registered or the
    /// factory failed.
    pub fn start(&self, task_id: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(task_id) else {
            debug!(task_id = %task_id, "No monitor registered");
            return false;
        };
        if entry.schedule.is_some() {
            return true;
        }
        let Some(monitor) = self.materialize(task_id, &mut entry) else {
            return false;
        };

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_schedule(
            task_id.to_string(),
            monitor,
            self.pool.clone(),
            token.clone(),
            self.config.initial_delay(),
            self.config.period(),
            self.firings.clone(),
        ));
        entry.schedule = Some(ScheduleHandle { token, handle });
        drop(entry);

        info!(task_id = %task_id, "Monitor started");
        self.events.publish(MonitorEvent::Started {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Forward a pause signal to the task's live monitor.
    ///
    /// The schedule is left in place and keeps firing; only [`close`](Self::close)
    /// cancels it. Returns the monitor's answer, or `false` if there is no
    /// live instance.
    pub fn stop(&self, task_id: &str) -> bool {
        let Some(monitor) = self.live_monitor(task_id) else {
            return false;
        };
        let stopped = monitor.stop();
        info!(task_id = %task_id, stopped, "Monitor stop requested");
        self.events.publish(MonitorEvent::Stopped {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
        stopped
    }

    /// Remove the task's monitor together with its factory and cancel its
    /// schedule, interrupting a `monitor()` call in progress.
    ///
    /// Returns `false` if the task had no live instance; a registered but
    /// never built monitor stays registered in that case.
    pub fn close(&self, task_id: &str) -> bool {
        let Some((_, entry)) = self
            .entries
            .remove_if(task_id, |_, entry| entry.instance.is_some())
        else {
            return false;
        };

        self.release(task_id, entry);
        info!(task_id = %task_id, "Monitor closed");
        true
    }

    /// Drop a registration whose monitor was never built.
    ///
    /// Returns `false` if the task is unknown or has a live monitor, which
    /// only [`close`](Self::close) releases.
    pub fn unregister(&self, task_id: &str) -> bool {
        let removed = self
            .entries
            .remove_if(task_id, |_, entry| entry.instance.is_none())
            .is_some();
        if removed {
            debug!(task_id = %task_id, "Monitor unregistered");
        }
        removed
    }

    /// Close every task, built or not. Returns how many schedules were cancelled.
    pub fn close_all(&self) -> usize {
        let task_ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for task_id in task_ids {
            if let Some((_, entry)) = self.entries.remove(&task_id) {
                if entry.schedule.is_some() {
                    cancelled += 1;
                }
                self.release(&task_id, entry);
            }
        }
        if cancelled > 0 {
            info!(cancelled, "Closed all monitors");
        }
        cancelled
    }

    fn release(&self, task_id: &str, entry: MonitorEntry) {
        if let Some(monitor) = entry.instance {
            monitor.stop();
        }
        if let Some(schedule) = entry.schedule {
            schedule.cancel();
        }
        self.events.publish(MonitorEvent::Closed {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// The task's monitor, building it from the registered factory if needed.
    ///
    /// Does not schedule anything.
    pub fn get_monitor(&self, task_id: &str) -> Option<Arc<dyn TaskMonitor>> {
        let mut entry = self.entries.get_mut(task_id)?;
        self.materialize(task_id, &mut entry)
    }

    /// The task's monitor only if it has already been built.
    pub fn live_monitor(&self, task_id: &str) -> Option<Arc<dyn TaskMonitor>> {
        self.entries.get(task_id)?.instance.clone()
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.entries
            .get(task_id)
            .is_some_and(|entry| entry.schedule.is_some())
    }

    /// Number of active schedules.
    pub fn scheduled_count(&self) -> usize {
        self.entries.iter().filter(|e| e.schedule.is_some()).count()
    }

    /// Total completed `monitor()` calls across all tasks.
    pub fn firings(&self) -> u64 {
        self.firings.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Build the monitor while the caller holds the entry lock.
    ///
    /// Factories must not call back into the scheduler.
    fn materialize(&self, task_id: &str, entry: &mut MonitorEntry) -> Option<Arc<dyn TaskMonitor>> {
        if let Some(monitor) = &entry.instance {
            return Some(monitor.clone());
        }
        let factory = entry.factory.clone()?;

        match factory(task_id) {
            Ok(monitor) => {
                entry.instance = Some(monitor.clone());
                trace!(task_id = %task_id, "Monitor instantiated");
                Some(monitor)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Monitor construction failed, task runs unmonitored");
                self.events.publish(MonitorEvent::ConstructionFailed {
                    task_id: task_id.to_string(),
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
                None
            }
        }
    }
}

impl Default for MonitorScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_schedule(
    task_id: String,
    monitor: Arc<dyn TaskMonitor>,
    pool: Arc<Semaphore>,
    token: CancellationToken,
    initial_delay: Duration,
    period: Duration,
    firings: Arc<AtomicU64>,
) {
    if !initial_delay.is_zero() {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }
    }

    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = pool.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = monitor.monitor() => {
                firings.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(permit);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    trace!(task_id = %task_id, "Monitor schedule ended");
}

#[async_trait]
impl Plugin for MonitorScheduler {
    async fn shutdown(&self) -> Result<()> {
        self.close_all();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;
    use crate::Error;
    use crate::monitor::monitor_factory;

    #[derive(Default)]
    struct Counters {
        built: AtomicUsize,
        fired: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct Counting {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl TaskMonitor for Counting {
        async fn monitor(&self) {
            self.counters.fired.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) -> bool {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn counting(counters: &Arc<Counters>) -> MonitorFactory {
        let counters = counters.clone();
        monitor_factory(move |_| {
            counters.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Counting {
                counters: counters.clone(),
            }) as Arc<dyn TaskMonitor>)
        })
    }

    fn fired(counters: &Counters) -> usize {
        counters.fired.load(Ordering::SeqCst)
    }

    /// Marks its flag when the in-flight `monitor()` future is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct Hanging {
        entered: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskMonitor for Hanging {
        async fn monitor(&self) {
            let _flag = DropFlag(self.dropped.clone());
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        fn stop(&self) -> bool {
            true
        }
    }

    fn hanging(entered: &Arc<AtomicUsize>, dropped: &Arc<AtomicBool>) -> MonitorFactory {
        let entered = entered.clone();
        let dropped = dropped.clone();
        monitor_factory(move |_| {
            Ok(Arc::new(Hanging {
                entered: entered.clone(),
                dropped: dropped.clone(),
            }) as Arc<dyn TaskMonitor>)
        })
    }

    #[test]
    fn test_config_defaults() {
        let config = MonitorSchedulerConfig::default();
        assert_eq!(config.period(), Duration::from_secs(1));
        assert_eq!(config.initial_delay(), Duration::ZERO);
        assert_eq!(config.max_concurrent, 20);
    }

    #[tokio::test]
    async fn test_start_unregistered() {
        let scheduler = MonitorScheduler::new();
        assert!(!scheduler.start("room-1"));

        scheduler.register("room-1", None);
        assert!(!scheduler.is_registered("room-1"));
        assert!(!scheduler.start("room-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fires_immediately_then_periodically() {
        let counters = Arc::new(Counters::default());
        let scheduler = MonitorScheduler::new();
        scheduler.register("room-1", Some(counting(&counters)));

        assert!(scheduler.start("room-1"));
        assert!(scheduler.is_scheduled("room-1"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired(&counters), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fired(&counters), 2);
        assert_eq!(scheduler.firings(), 2);

        scheduler.close("room-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let scheduler = MonitorScheduler::new();
        scheduler.register("room-1", Some(counting(&counters)));

        assert!(scheduler.start("room-1"));
        assert!(scheduler.start("room-1"));
        assert_eq!(counters.built.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.scheduled_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired(&counters), 1);
        scheduler.close_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_schedule_firing() {
        let counters = Arc::new(Counters::default());
        let scheduler = MonitorScheduler::new();
        assert!(!scheduler.stop("room-1"));

        scheduler.register("room-1", Some(counting(&counters)));
        // registered but not built yet
        assert!(!scheduler.stop("room-1"));

        scheduler.start("room-1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(scheduler.stop("room-1"));
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_scheduled("room-1"));

        let before = fired(&counters);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(fired(&counters) > before);
        scheduler.close("room-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_and_requires_register() {
        let counters = Arc::new(Counters::default());
        let scheduler = MonitorScheduler::new();
        let mut events = scheduler.subscribe();
        scheduler.register("room-1", Some(counting(&counters)));
        scheduler.start("room-1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(scheduler.close("room-1"));
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_registered("room-1"));

        let after_close = fired(&counters);
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(fired(&counters), after_close);

        assert!(!scheduler.close("room-1"));
        assert!(!scheduler.start("room-1"));

        assert!(matches!(events.recv().await.unwrap(), MonitorEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), MonitorEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_close_without_instance_keeps_registration() {
        let counters = Arc::new(Counters::default());
        let scheduler = MonitorScheduler::new();
        scheduler.register("room-1", Some(counting(&counters)));

        assert!(!scheduler.close("room-1"));
        assert!(scheduler.is_registered("room-1"));
        assert!(scheduler.live_monitor("room-1").is_none());

        assert!(scheduler.get_monitor("room-1").is_some());
        assert!(scheduler.live_monitor("room-1").is_some());
        assert!(!scheduler.is_scheduled("room-1"));
        assert!(scheduler.close("room-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_only_drops_unbuilt_monitors() {
        let counters = Arc::new(Counters::default());
        let scheduler = MonitorScheduler::new();
        assert!(!scheduler.unregister("room-1"));

        scheduler.register("room-1", Some(counting(&counters)));
        assert!(scheduler.unregister("room-1"));
        assert!(!scheduler.is_registered("room-1"));

        scheduler.register("room-2", Some(counting(&counters)));
        assert!(scheduler.start("room-2"));
        assert!(!scheduler.unregister("room-2"));
        assert!(scheduler.is_scheduled("room-2"));
        assert!(scheduler.close("room-2"));
    }

    #[tokio::test]
    async fn test_construction_failure_degrades() {
        let scheduler = MonitorScheduler::new();
        let mut events = scheduler.subscribe();
        scheduler.register(
            "room-1",
            Some(monitor_factory(|id| {
                Err(Error::monitor_construction(id, "missing credentials"))
            })),
        );

        assert!(!scheduler.start("room-1"));
        assert!(!scheduler.is_scheduled("room-1"));
        match events.recv().await.unwrap() {
            MonitorEvent::ConstructionFailed { task_id, reason, .. } => {
                assert_eq!(task_id, "room-1");
                assert!(reason.contains("missing credentials"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_running_monitor() {
        let entered = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let scheduler = MonitorScheduler::new();
        scheduler.register("room-1", Some(hanging(&entered, &dropped)));
        scheduler.start("room-1");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert!(!dropped.load(Ordering::SeqCst));

        scheduler.close("room-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrent_monitors() {
        let entered = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let scheduler = MonitorScheduler::with_config(MonitorSchedulerConfig {
            max_concurrent: 1,
            ..Default::default()
        });
        scheduler.register("room-1", Some(hanging(&entered, &dropped)));
        scheduler.register("room-2", Some(hanging(&entered, &dropped)));
        scheduler.start("room-1");
        scheduler.start("room-2");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        // room-1 was scheduled first and holds the only slot
        assert!(scheduler.close("room-1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        scheduler.close("room-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugin_shutdown_closes_everything() {
        let counters = Arc::new(Counters::default());
        let scheduler = Arc::new(MonitorScheduler::new());
        scheduler.register("room-1", Some(counting(&counters)));
        scheduler.register("room-2", Some(counting(&counters)));
        scheduler.start("room-1");
        scheduler.start("room-2");

        Plugin::shutdown(scheduler.as_ref()).await.unwrap();
        assert_eq!(scheduler.scheduled_count(), 0);
        assert!(!scheduler.is_registered("room-1"));
    }
}

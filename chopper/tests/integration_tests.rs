//! Integration tests for the chopper orchestration core.
//!
//! These drive the public API end to end: plugin boot and teardown order,
//! concurrent ingestion into a real on-disk file cache, monitor scheduling
//! races and a full crawl through the service container.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use barrage_cache::{Barrage, JsonFileCache};
use chopper::monitor::{MonitorFactory, MonitorScheduler, TaskMonitor, monitor_factory};
use chopper::{Error, Result};

struct Counting {
    fired: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskMonitor for Counting {
    async fn monitor(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) -> bool {
        true
    }
}

fn counting_factory(fired: &Arc<AtomicUsize>, built: &Arc<AtomicUsize>) -> MonitorFactory {
    let fired = fired.clone();
    let built = built.clone();
    monitor_factory(move |_| {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Counting {
            fired: fired.clone(),
        }) as Arc<dyn TaskMonitor>)
    })
}

mod lifecycle_tests {
    use std::any::Any;

    use chopper::plugin::{Plugin, PluginId, PluginManager, PluginSpec, PluginState};
    use parking_lot::Mutex;

    use super::*;

    struct Stamped {
        name: &'static str,
        starts: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Plugin for Stamped {
        async fn start(&self) -> Result<()> {
            // yield so a wrong order would have a chance to interleave
            tokio::task::yield_now().await;
            self.starts.lock().push(self.name);
            Ok(())
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn spec(name: &'static str, deps: &[&'static str], starts: &Arc<Mutex<Vec<&'static str>>>) -> PluginSpec {
        let starts = starts.clone();
        let mut spec = PluginSpec::new(PluginId::new("it", name), move |_| {
            Ok(Arc::new(Stamped {
                name,
                starts: starts.clone(),
            }) as Arc<dyn Plugin>)
        });
        for dep in deps {
            spec = spec.depends_on(PluginId::new("it", *dep));
        }
        spec
    }

    #[tokio::test]
    async fn test_every_plugin_starts_after_its_dependencies() {
        let graph: &[(&'static str, &[&'static str])] = &[
            ("api", &["tasks", "auth"]),
            ("tasks", &["cache", "monitor"]),
            ("monitor", &["cache"]),
            ("auth", &["config"]),
            ("cache", &["config"]),
            ("config", &[]),
            ("metrics", &[]),
        ];

        let starts = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new();
        for (name, deps) in graph {
            manager.register(spec(*name, *deps, &starts)).unwrap();
        }
        manager.boot_all().await.unwrap();

        let starts = starts.lock().clone();
        assert_eq!(starts.len(), graph.len());
        let position = |n: &str| starts.iter().position(|s| *s == n).unwrap();
        for (name, deps) in graph {
            for dep in *deps {
                assert!(
                    position(*dep) < position(*name),
                    "{dep} must start before {name}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_cycle_aborts_boot_with_nothing_started() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let manager = PluginManager::new();
        manager.register(spec("config", &[], &starts)).unwrap();
        manager.register(spec("a", &["config", "b"], &starts)).unwrap();
        manager.register(spec("b", &["a"], &starts)).unwrap();

        let err = manager.boot_all().await.unwrap_err();
        assert!(err.is_fatal_at_boot());
        let message = err.to_string();
        assert!(message.contains("it/a") && message.contains("it/b"), "{message}");
        assert!(!message.contains("it/config"), "{message}");

        assert!(starts.lock().is_empty());
        for status in manager.statuses() {
            assert_eq!(status.state, PluginState::Created);
        }
    }
}

mod pipeline_tests {
    use chopper::ingest::{IngestPipeline, PipelineState};

    use super::*;

    fn keys() -> Vec<String> {
        vec!["bilibili".to_string(), "777".to_string()]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_no_loss_no_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(JsonFileCache::with_threshold(dir.path(), 512));
        let pipeline = Arc::new(IngestPipeline::<Barrage>::new(cache.clone()));

        const PRODUCERS: usize = 12;
        const BATCHES: usize = 40;
        const BATCH_SIZE: usize = 25;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let pipeline = pipeline.clone();
                tokio::task::spawn_blocking(move || {
                    for b in 0..BATCHES {
                        let batch = (0..BATCH_SIZE)
                            .rev()
                            .map(|i| Barrage::new(format!("{p:02}-{b:03}-{i:03}"), "u", "user", "hello"))
                            .collect();
                        pipeline.process(batch).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let total = PRODUCERS * BATCHES * BATCH_SIZE;
        assert_eq!(pipeline.cache_size(), total);

        let written = pipeline.drain_and_flush(&keys()).await.unwrap();
        assert_eq!(written, total);
        assert_eq!(pipeline.state(), PipelineState::Flushed);
        assert_eq!(pipeline.cache_size(), 0);

        let result = pipeline.result();
        let ids: HashSet<&str> = result.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids.len(), total);

        let path = cache.partition_path(&keys()).unwrap();
        let on_disk: Vec<Barrage> = std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(on_disk.len(), total);
        let disk_ids: Vec<&str> = on_disk.iter().map(|b| b.id.as_str()).collect();
        let drained_ids: Vec<&str> = result.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(disk_ids, drained_ids);
    }

    #[tokio::test]
    async fn test_rejects_work_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = IngestPipeline::<Barrage>::new(Arc::new(JsonFileCache::new(dir.path())));
        pipeline.drain_and_flush(&keys()).await.unwrap();

        let err = pipeline
            .process(vec![Barrage::new("1", "u", "user", "hi")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_invalid_partition_fails_drain() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = IngestPipeline::<Barrage>::new(Arc::new(JsonFileCache::new(dir.path())));
        pipeline
            .process(vec![Barrage::new("1", "u", "user", "hi")])
            .unwrap();

        let err = pipeline
            .drain_and_flush(&["..".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
        assert_eq!(pipeline.cache_size(), 0);
        assert!(pipeline.result().is_empty());
    }
}

mod monitor_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_yields_single_schedule() {
        for _ in 0..20 {
            let scheduler = Arc::new(MonitorScheduler::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let built = Arc::new(AtomicUsize::new(0));

            // Starters race the registration.
            let starters: Vec<_> = (0..8)
                .map(|_| {
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        loop {
                            if scheduler.start("room-1") {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            scheduler.register("room-1", Some(counting_factory(&fired, &built)));

            for starter in starters {
                starter.await.unwrap();
            }

            assert_eq!(built.load(Ordering::SeqCst), 1);
            assert_eq!(scheduler.scheduled_count(), 1);
            assert!(scheduler.close("room-1"));
            assert_eq!(scheduler.scheduled_count(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_start_leaks_no_schedule() {
        for _ in 0..50 {
            let scheduler = Arc::new(MonitorScheduler::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let built = Arc::new(AtomicUsize::new(0));
            scheduler.register("room-1", Some(counting_factory(&fired, &built)));

            let starter = {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.start("room-1") })
            };
            let closer = {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.close("room-1") })
            };
            let started = starter.await.unwrap();
            let closed = closer.await.unwrap();
            assert!(started);

            if closed {
                // close won after start: everything released
                assert!(!scheduler.is_registered("room-1"));
                assert_eq!(scheduler.scheduled_count(), 0);
            } else {
                // close ran first and found nothing live
                assert_eq!(scheduler.scheduled_count(), 1);
                assert!(scheduler.close("room-1"));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_then_start_requires_new_registration() {
        let scheduler = MonitorScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let built = Arc::new(AtomicUsize::new(0));

        scheduler.register("room-1", Some(counting_factory(&fired, &built)));
        assert!(scheduler.start("room-1"));
        assert!(scheduler.close("room-1"));
        assert!(!scheduler.start("room-1"));

        scheduler.register("room-1", Some(counting_factory(&fired, &built)));
        assert!(scheduler.start("room-1"));
        assert_eq!(built.load(Ordering::SeqCst), 2);
        scheduler.close("room-1");
    }
}

mod end_to_end {
    use chopper::config::ChopperConfig;
    use chopper::ingest::IngestPipeline;
    use chopper::plugin::PluginState;
    use chopper::services::{ServiceContainer, file_cache_id, monitor_id, task_center_id};
    use chopper::task::{CrawlEngine, CrawlRequest, TaskConfig, TaskOutcome, TaskStatus};
    use tokio::sync::{Notify, oneshot};
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Pushes one batch, then waits to be released.
    struct Gated {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl CrawlEngine for Gated {
        async fn crawl(
            &self,
            config: &TaskConfig,
            sink: Arc<IngestPipeline<Barrage>>,
            cancel: CancellationToken,
        ) -> Result<()> {
            let batch = (0..5)
                .map(|i| Barrage::new(format!("{}-{i}", config.room_id), "u", "user", "hi"))
                .collect();
            sink.process(batch)?;

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.release.notified() => {}
            }
            Ok(())
        }
    }

    fn container(dir: &std::path::Path, release: &Arc<Notify>) -> ServiceContainer {
        let config = ChopperConfig {
            data_dir: dir.to_path_buf(),
            log_dir: dir.join("logs"),
            ..Default::default()
        };
        ServiceContainer::new(
            config,
            Arc::new(Gated {
                release: release.clone(),
            }),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_crawl_with_monitor_through_container() {
        let dir = tempfile::tempdir().unwrap();
        let release = Arc::new(Notify::new());
        let container = container(dir.path(), &release);

        let order = container.boot().await.unwrap();
        let position = |id| order.iter().position(|p| *p == id).unwrap();
        assert!(position(file_cache_id()) < position(task_center_id()));
        assert!(position(file_cache_id()) < position(monitor_id()));

        let fired = Arc::new(AtomicUsize::new(0));
        let built = Arc::new(AtomicUsize::new(0));
        let config = TaskConfig::new("huya", "42").with_monitor(counting_factory(&fired, &built));
        let (tx, rx) = oneshot::channel::<TaskOutcome>();
        let task_id = container
            .request(CrawlRequest::new(config, move |outcome| {
                let _ = tx.send(outcome);
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(fired.load(Ordering::SeqCst) >= 2);

        let monitors = container.monitors().unwrap();
        assert!(monitors.close(&task_id));
        let after_close = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_close);

        release.notify_one();
        let outcome = rx.await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.items_written, 5);

        let center = container.task_center().unwrap();
        assert_eq!(center.record(&task_id).unwrap().status, TaskStatus::Completed);

        let report = container.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(
            container.plugins().state(&file_cache_id()),
            Some(PluginState::ShutDown)
        );

        let path = container.config().barrage_dir().join("huya").join("42.jsonl");
        assert_eq!(std::fs::read_to_string(path).unwrap().lines().count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_running_crawls() {
        let dir = tempfile::tempdir().unwrap();
        let release = Arc::new(Notify::new());
        let container = container(dir.path(), &release);
        container.boot().await.unwrap();

        let (tx, rx) = oneshot::channel::<TaskOutcome>();
        container
            .request(CrawlRequest::new(TaskConfig::new("douyu", "8"), move |outcome| {
                let _ = tx.send(outcome);
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = container.shutdown().await;
        assert!(report.is_clean());

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.items_written, 5);

        let path = container.config().barrage_dir().join("douyu").join("8.jsonl");
        assert_eq!(std::fs::read_to_string(path).unwrap().lines().count(), 5);
    }
}

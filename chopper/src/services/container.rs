//! Service container.
//!
//! The ServiceContainer is the single root object: it owns the plugin manager,
//! registers the core plugins with their dependencies and drives boot and
//! shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ChopperConfig;
use crate::ingest::FileCachePlugin;
use crate::monitor::MonitorScheduler;
use crate::plugin::{Plugin, PluginId, PluginManager, PluginSpec, PluginState, ShutdownReport};
use crate::task::{CrawlEngine, CrawlRequest, TaskCenter};
use crate::{Error, Result};

/// Module owning the core plugins.
pub const CORE_MODULE: &str = "creeper";

pub fn file_cache_id() -> PluginId {
    PluginId::new(CORE_MODULE, "file-cache")
}

pub fn monitor_id() -> PluginId {
    PluginId::new(CORE_MODULE, "monitor")
}

pub fn task_center_id() -> PluginId {
    PluginId::new(CORE_MODULE, "task-center")
}

/// Root object holding every service.
pub struct ServiceContainer {
    config: ChopperConfig,
    plugins: PluginManager,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a container with the core plugins registered but not booted.
    pub fn new(config: ChopperConfig, engine: Arc<dyn CrawlEngine>) -> Result<Self> {
        config.validate()?;
        info!("Initializing service container");

        let plugins = PluginManager::new();

        let barrage_dir = config.barrage_dir();
        let cache_config = config.file_cache.clone();
        plugins.register(PluginSpec::new(file_cache_id(), move |_| {
            Ok(Arc::new(FileCachePlugin::new(barrage_dir.clone(), &cache_config)) as Arc<dyn Plugin>)
        }))?;

        let monitor_config = config.monitor.clone();
        plugins.register(
            PluginSpec::new(monitor_id(), move |_| {
                Ok(Arc::new(MonitorScheduler::with_config(monitor_config.clone())) as Arc<dyn Plugin>)
            })
            .depends_on(file_cache_id()),
        )?;

        let task_config = config.task_center.clone();
        plugins.register(
            PluginSpec::new(task_center_id(), move |manager| {
                let cache = manager.get_as::<FileCachePlugin>(&file_cache_id())?.cache();
                let monitors = manager.get_as::<MonitorScheduler>(&monitor_id())?;
                Ok(Arc::new(TaskCenter::new(
                    task_config.clone(),
                    engine.clone(),
                    cache,
                    monitors,
                )) as Arc<dyn Plugin>)
            })
            .depends_on(file_cache_id())
            .depends_on(monitor_id()),
        )?;

        Ok(Self {
            config,
            plugins,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Create a container from `.env` and `CHOPPER_*` environment variables.
    pub fn from_env(engine: Arc<dyn CrawlEngine>) -> Result<Self> {
        Self::new(ChopperConfig::from_env()?, engine)
    }

    /// Register an additional plugin. Only possible before [`boot`](Self::boot).
    pub fn register(&self, spec: PluginSpec) -> Result<()> {
        self.plugins.register(spec)
    }

    /// Bring every plugin up in dependency order.
    pub async fn boot(&self) -> Result<Vec<PluginId>> {
        let order = self.plugins.boot_all().await?;
        info!(
            order = %order.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "Services started"
        );
        Ok(order)
    }

    /// Shut every plugin down in reverse dependency order.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        let report = self.plugins.shutdown_all().await;
        if !report.is_clean() {
            for (id, error) in &report.failed {
                warn!(plugin = %id, error = %error, "Service did not shut down cleanly");
            }
        }
        info!("Services shut down");
        report
    }

    /// Submit a crawl request to the task center.
    pub fn request(&self, request: CrawlRequest) -> Result<String> {
        let id = task_center_id();
        match self
            .plugins
            .with_started(&id, |center: Arc<TaskCenter>| center.request(request))
        {
            Some(result) => result,
            None if self.plugins.state(&id) == Some(PluginState::ShutDown) => {
                Err(Error::ShuttingDown)
            }
            None => Err(Error::PluginNotFound { id }),
        }
    }

    pub fn config(&self) -> &ChopperConfig {
        &self.config
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn file_cache(&self) -> Result<Arc<FileCachePlugin>> {
        self.plugins.get_as(&file_cache_id())
    }

    pub fn monitors(&self) -> Result<Arc<MonitorScheduler>> {
        self.plugins.get_as(&monitor_id())
    }

    pub fn task_center(&self) -> Result<Arc<TaskCenter>> {
        self.plugins.get_as(&task_center_id())
    }

    /// Token cancelled when shutdown begins.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

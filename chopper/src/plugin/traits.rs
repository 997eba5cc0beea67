//! Plugin trait and registration spec.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::manager::PluginManager;
use super::types::PluginId;
use crate::Result;

/// A lifecycle-managed subsystem.
///
/// Hooks default to no-ops so plugins only implement the phases they use.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Prepare resources. Dependencies are initialized but not yet started.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Begin serving. Every dependency has completed `start`.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Release resources. Called at most once.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Upcast used for typed lookup; implement as `{ self }`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Builds a plugin instance. Receives the manager so it can look up its
/// (already initialized) dependencies.
pub type PluginFactory = Arc<dyn Fn(&PluginManager) -> Result<Arc<dyn Plugin>> + Send + Sync>;

/// Registration record for a plugin.
#[derive(Clone)]
pub struct PluginSpec {
    pub id: PluginId,
    pub dependencies: Vec<PluginId>,
    pub autostart: bool,
    pub factory: PluginFactory,
}

impl PluginSpec {
    /// Create a spec with no dependencies that starts automatically.
    pub fn new<F>(id: PluginId, factory: F) -> Self
    where
        F: Fn(&PluginManager) -> Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        Self {
            id,
            dependencies: Vec::new(),
            autostart: true,
            factory: Arc::new(factory),
        }
    }

    /// Create a spec around an already constructed instance.
    pub fn with_instance<P: Plugin>(id: PluginId, instance: Arc<P>) -> Self {
        Self::new(id, move |_| Ok(instance.clone() as Arc<dyn Plugin>))
    }

    /// Declare a dependency. Duplicates are ignored.
    pub fn depends_on(mut self, dependency: PluginId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Set whether the plugin starts during `boot_all`.
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSpec")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("autostart", &self.autostart)
            .finish_non_exhaustive()
    }
}

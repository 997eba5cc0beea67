//! Plugin lifecycle manager.
//!
//! The manager owns the plugin registry. `boot_all` resolves the dependency
//! graph, constructs and initializes every plugin in topological order, then
//! starts the autostart ones in the same order. `shutdown_all` walks the order
//! backwards.
//!
//! The registry lock is never held across a plugin hook, so hooks and
//! factories are free to call back into the manager.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::graph::resolve_boot_order;
use super::traits::{Plugin, PluginSpec};
use super::types::{PluginId, PluginState, PluginStatus};
use crate::{Error, Result};

struct PluginEntry {
    spec: PluginSpec,
    state: PluginState,
    instance: Option<Arc<dyn Plugin>>,
    started_at: Option<DateTime<Utc>>,
    /// A hook is running for this plugin.
    busy: bool,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<PluginId, PluginEntry>,
    /// Registration order.
    order: Vec<PluginId>,
    /// Resolved topological order, set once `boot_all` passes graph checks.
    boot_order: Option<Vec<PluginId>>,
}

impl Registry {
    fn entry(&self, id: &PluginId) -> Result<&PluginEntry> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::PluginNotFound { id: id.clone() })
    }

    fn entry_mut(&mut self, id: &PluginId) -> Result<&mut PluginEntry> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| Error::PluginNotFound { id: id.clone() })
    }

    fn effective_order(&self) -> Vec<PluginId> {
        self.boot_order.clone().unwrap_or_else(|| self.order.clone())
    }

    /// First dependency of `id` that has not reached `Started`.
    fn unstarted_dependency(&self, id: &PluginId) -> Option<PluginId> {
        let entry = self.entries.get(id)?;
        entry
            .spec
            .dependencies
            .iter()
            .find(|dep| self.entries.get(*dep).map(|e| e.state) != Some(PluginState::Started))
            .cloned()
    }
}

/// Outcome of [`PluginManager::shutdown_all`].
#[derive(Debug, Default, Clone)]
pub struct ShutdownReport {
    /// Plugins whose `shutdown` hook succeeded, in the order it ran.
    pub shut_down: Vec<PluginId>,
    /// Plugins whose `shutdown` hook failed, with the error message.
    pub failed: Vec<(PluginId, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry and lifecycle driver for plugins.
#[derive(Default)]
pub struct PluginManager {
    registry: RwLock<Registry>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin.
    ///
    /// Fails with `DuplicatePlugin` if the identity is taken, and with
    /// `InvalidStateTransition` once `boot_all` has run.
    pub fn register(&self, spec: PluginSpec) -> Result<()> {
        let mut reg = self.registry.write();
        if reg.boot_order.is_some() {
            return Err(Error::invalid_transition("BOOTED", "REGISTERED"));
        }
        if reg.entries.contains_key(&spec.id) {
            return Err(Error::DuplicatePlugin {
                id: spec.id.clone(),
            });
        }

        debug!(
            plugin = %spec.id,
            dependencies = spec.dependencies.len(),
            autostart = spec.autostart,
            "Plugin registered"
        );
        let id = spec.id.clone();
        reg.order.push(id.clone());
        reg.entries.insert(
            id,
            PluginEntry {
                spec,
                state: PluginState::Created,
                instance: None,
                started_at: None,
                busy: false,
            },
        );
        Ok(())
    }

    /// Resolve the dependency graph, initialize every plugin and start the
    /// autostart ones. Returns the boot order.
    ///
    /// Graph errors are reported before any plugin is constructed. If a
    /// factory, `init` or `start` fails, everything brought up so far is shut
    /// down in reverse order and the error is returned.
    pub async fn boot_all(&self) -> Result<Vec<PluginId>> {
        let order = {
            let mut reg = self.registry.write();
            if reg.boot_order.is_some() {
                return Err(Error::invalid_transition("BOOTED", "BOOTED"));
            }
            let nodes: Vec<(PluginId, Vec<PluginId>)> = reg
                .order
                .iter()
                .filter_map(|id| {
                    reg.entries
                        .get(id)
                        .map(|e| (id.clone(), e.spec.dependencies.clone()))
                })
                .collect();

            let order = resolve_boot_order(&nodes).inspect_err(|e| {
                error!(error = %e, "Plugin dependency graph is invalid");
            })?;
            reg.boot_order = Some(order.clone());
            order
        };

        info!(count = order.len(), "Booting plugins");

        for id in &order {
            if let Err(e) = self.init_plugin(id).await {
                error!(plugin = %id, error = %e, "Plugin failed to initialize, rolling back");
                self.shutdown_all().await;
                return Err(e);
            }
        }

        for id in &order {
            let (autostart, blocked_on) = {
                let reg = self.registry.read();
                let autostart = reg.entry(id)?.spec.autostart;
                (autostart, reg.unstarted_dependency(id))
            };

            if !autostart {
                debug!(plugin = %id, "Plugin is dormant, waiting for manual start");
                continue;
            }
            if let Some(dep) = blocked_on {
                warn!(
                    plugin = %id,
                    dependency = %dep,
                    "Skipping autostart: dependency is not started"
                );
                continue;
            }
            if let Err(e) = self.start(id).await {
                error!(plugin = %id, error = %e, "Plugin failed to start, rolling back");
                self.shutdown_all().await;
                return Err(e);
            }
        }

        info!("All plugins booted");
        Ok(order)
    }

    async fn init_plugin(&self, id: &PluginId) -> Result<()> {
        let factory = {
            let mut reg = self.registry.write();
            let entry = reg.entry_mut(id)?;
            if entry.state != PluginState::Created || entry.busy {
                return Err(Error::invalid_transition(entry.state, PluginState::Initialized));
            }
            entry.busy = true;
            entry.spec.factory.clone()
        };

        let result = match factory(self) {
            Ok(instance) => instance.init().await.map(|_| instance),
            Err(e) => Err(e),
        };

        let instance = {
            let mut reg = self.registry.write();
            let entry = reg.entry_mut(id)?;
            entry.busy = false;
            let instance = result?;
            if entry.state.can_transition_to(PluginState::Initialized) {
                entry.instance = Some(instance);
                entry.state = PluginState::Initialized;
                debug!(plugin = %id, "Plugin initialized");
                return Ok(());
            }
            instance
        };
        self.shut_down_late(id, instance, PluginState::Initialized).await
    }

    /// Start an initialized plugin.
    ///
    /// Used by `boot_all` for autostart plugins and by callers to bring up
    /// dormant ones. Every dependency must already be started.
    pub async fn start(&self, id: &PluginId) -> Result<()> {
        let instance = {
            let mut reg = self.registry.write();
            if let Some(dep) = reg.unstarted_dependency(id) {
                let state = reg.entry(id)?.state;
                return Err(Error::invalid_transition(
                    state,
                    format!("{} (dependency {dep} is not started)", PluginState::Started),
                ));
            }
            let entry = reg.entry_mut(id)?;
            if entry.state != PluginState::Initialized || entry.busy {
                return Err(Error::invalid_transition(entry.state, PluginState::Started));
            }
            let Some(instance) = entry.instance.clone() else {
                return Err(Error::PluginNotFound { id: id.clone() });
            };
            entry.busy = true;
            instance
        };

        let result = instance.start().await;

        {
            let mut reg = self.registry.write();
            let entry = reg.entry_mut(id)?;
            entry.busy = false;
            if entry.state.can_transition_to(PluginState::Started) {
                result?;
                entry.state = PluginState::Started;
                entry.started_at = Some(Utc::now());
                info!(plugin = %id, "Plugin started");
                return Ok(());
            }
        }
        self.shut_down_late(id, instance, PluginState::Started).await
    }

    /// Run the shutdown hook `shutdown_all` deferred because a hook was in
    /// progress, and report the interrupted transition.
    async fn shut_down_late(
        &self,
        id: &PluginId,
        instance: Arc<dyn Plugin>,
        target: PluginState,
    ) -> Result<()> {
        warn!(plugin = %id, target = %target, "Plugin was shut down mid-transition");
        if let Err(e) = instance.shutdown().await {
            warn!(plugin = %id, error = %e, "Plugin shutdown failed");
        }
        Err(Error::invalid_transition(PluginState::ShutDown, target))
    }

    /// Shut down every plugin in reverse boot order.
    ///
    /// Each plugin is marked `ShutDown` before its hook runs so the hook is
    /// called at most once. Plugins not yet initialized are marked without a
    /// hook and will never be initialized. A plugin whose `init` or `start`
    /// is still running is marked too; that call runs the hook once it
    /// returns. Failures are logged and collected; they never stop the
    /// remaining plugins from being shut down.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let order = self.registry.read().effective_order();
        let mut report = ShutdownReport::default();

        for id in order.iter().rev() {
            let instance = {
                let mut reg = self.registry.write();
                let Some(entry) = reg.entries.get_mut(id) else {
                    continue;
                };
                if entry.state == PluginState::ShutDown {
                    continue;
                }
                let live = entry.state.is_live();
                entry.state = PluginState::ShutDown;
                if !live {
                    continue;
                }
                if entry.busy {
                    debug!(plugin = %id, "Plugin is mid-transition, deferring its shutdown hook");
                    continue;
                }
                entry.instance.clone()
            };
            let Some(instance) = instance else {
                continue;
            };

            match instance.shutdown().await {
                Ok(()) => {
                    debug!(plugin = %id, "Plugin shut down");
                    report.shut_down.push(id.clone());
                }
                Err(e) => {
                    warn!(plugin = %id, error = %e, "Plugin shutdown failed");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        info!(
            shut_down = report.shut_down.len(),
            failed = report.failed.len(),
            "Plugin shutdown complete"
        );
        report
    }

    /// Look up an initialized plugin.
    pub fn get(&self, id: &PluginId) -> Result<Arc<dyn Plugin>> {
        let reg = self.registry.read();
        reg.entries
            .get(id)
            .and_then(|e| e.instance.clone())
            .ok_or_else(|| Error::PluginNotFound { id: id.clone() })
    }

    /// Look up an initialized plugin as its concrete type.
    pub fn get_as<T: Plugin>(&self, id: &PluginId) -> Result<Arc<T>> {
        self.get(id)?
            .as_any()
            .downcast::<T>()
            .map_err(|_| Error::PluginTypeMismatch { id: id.clone() })
    }

    /// Run `f` against the plugin only if it is currently started.
    pub fn with_started<T, R, F>(&self, id: &PluginId, f: F) -> Option<R>
    where
        T: Plugin,
        F: FnOnce(Arc<T>) -> R,
    {
        let instance = {
            let reg = self.registry.read();
            let entry = reg.entries.get(id)?;
            if entry.state != PluginState::Started {
                return None;
            }
            entry.instance.clone()?
        };
        instance.as_any().downcast::<T>().ok().map(f)
    }

    /// Current state of a plugin.
    pub fn state(&self, id: &PluginId) -> Option<PluginState> {
        self.registry.read().entries.get(id).map(|e| e.state)
    }

    /// Snapshot of every plugin, in boot order once booted.
    pub fn statuses(&self) -> Vec<PluginStatus> {
        let reg = self.registry.read();
        reg.effective_order()
            .into_iter()
            .filter_map(|id| {
                reg.entries.get(&id).map(|e| PluginStatus {
                    id,
                    state: e.state,
                    autostart: e.spec.autostart,
                    dependencies: e.spec.dependencies.clone(),
                    started_at: e.started_at,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

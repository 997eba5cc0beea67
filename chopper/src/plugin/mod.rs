//! Plugin lifecycle management.
//!
//! Subsystems are registered as plugins with an explicit factory and an
//! explicit list of dependencies. The [`PluginManager`] resolves the
//! dependency graph, then drives every plugin through
//! `Created → Initialized → Started → ShutDown` in dependency order, and tears
//! them down in reverse.

mod graph;
mod guard;
mod manager;
mod traits;
mod types;

pub use graph::resolve_boot_order;
pub use guard::{GuardPlugin, GuardTask};
pub use manager::{PluginManager, ShutdownReport};
pub use traits::{Plugin, PluginFactory, PluginSpec};
pub use types::{PluginId, PluginState, PluginStatus};

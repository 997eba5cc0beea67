//! Plugin identity and state types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a plugin: the module it belongs to plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId {
    /// Owning module (e.g. "creeper").
    pub module: String,
    /// Plugin name, unique within the module.
    pub name: String,
}

impl PluginId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.name)
    }
}

/// Lifecycle state of a plugin.
///
/// States only move forward; a plugin that reached `ShutDown` is never
/// brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    /// Registered, factory not yet invoked.
    Created,
    /// Constructed and `init` completed.
    Initialized,
    /// `start` completed.
    Started,
    /// `shutdown` was attempted, or the plugin was retired before init.
    ShutDown,
}

impl PluginState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Initialized)
                | (Self::Created, Self::ShutDown)
                | (Self::Initialized, Self::Started)
                | (Self::Initialized, Self::ShutDown)
                | (Self::Started, Self::ShutDown)
        )
    }

    /// Whether the plugin has a live instance that needs shutting down.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Initialized | Self::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Initialized => "INITIALIZED",
            Self::Started => "STARTED",
            Self::ShutDown => "SHUT_DOWN",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub id: PluginId,
    pub state: PluginState,
    pub autostart: bool,
    pub dependencies: Vec<PluginId>,
    pub started_at: Option<DateTime<Utc>>,
}

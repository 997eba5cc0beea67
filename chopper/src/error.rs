//! Application-wide error types.

use thiserror::Error;

use barrage_cache::CacheError;

use crate::plugin::PluginId;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Plugin {id} is already registered")]
    DuplicatePlugin { id: PluginId },

    #[error("Cyclic plugin dependency detected involving: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<PluginId> },

    #[error("Plugin {plugin} depends on unregistered plugin {dependency}")]
    MissingDependency {
        plugin: PluginId,
        dependency: PluginId,
    },

    #[error("Plugin not found: {id}")]
    PluginNotFound { id: PluginId },

    #[error("Plugin {id} is not of the requested type")]
    PluginTypeMismatch { id: PluginId },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Failed to construct monitor for task {task_id}: {reason}")]
    MonitorConstruction { task_id: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Task {0} is already running")]
    TaskAlreadyRunning(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn monitor_construction(task_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::MonitorConstruction {
            task_id: task_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error belongs to the dependency-graph taxonomy that must
    /// abort startup.
    pub fn is_fatal_at_boot(&self) -> bool {
        matches!(
            self,
            Self::DuplicatePlugin { .. }
                | Self::CyclicDependency { .. }
                | Self::MissingDependency { .. }
        )
    }
}

fn format_cycle(cycle: &[PluginId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

//! Monitor lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the monitor scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// A schedule was created for the task.
    Started {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The monitor was asked to pause; its schedule keeps firing.
    Stopped {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The monitor was removed and its schedule cancelled.
    Closed {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The registered factory failed; the task runs unmonitored.
    ConstructionFailed {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn task_id(&self) -> &str {
        match self {
            MonitorEvent::Started { task_id, .. }
            | MonitorEvent::Stopped { task_id, .. }
            | MonitorEvent::Closed { task_id, .. }
            | MonitorEvent::ConstructionFailed { task_id, .. } => task_id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            MonitorEvent::Started { task_id, .. } => format!("{} monitor scheduled", task_id),
            MonitorEvent::Stopped { task_id, .. } => format!("{} monitor stopped", task_id),
            MonitorEvent::Closed { task_id, .. } => format!("{} monitor closed", task_id),
            MonitorEvent::ConstructionFailed {
                task_id, reason, ..
            } => format!("{}: monitor construction failed - {}", task_id, reason),
        }
    }
}

/// Broadcaster for monitor events.
#[derive(Clone)]
pub struct MonitorEventBroadcaster {
    sender: broadcast::Sender<MonitorEvent>,
}

impl MonitorEventBroadcaster {
    /// Create a new broadcaster with default capacity (256).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: MonitorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MonitorEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

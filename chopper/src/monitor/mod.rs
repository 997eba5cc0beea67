//! Per-task monitoring.
//!
//! Tasks register a [`MonitorFactory`] with the [`MonitorScheduler`]. The
//! monitor is built on first use and then invoked on a fixed-delay schedule
//! until the task is closed.

mod events;
mod scheduler;
mod task_monitor;

pub use events::{MonitorEvent, MonitorEventBroadcaster};
pub use scheduler::{MonitorScheduler, MonitorSchedulerConfig};
pub use task_monitor::{MonitorFactory, TaskMonitor, monitor_factory};

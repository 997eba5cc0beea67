//! Task bookkeeping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Status of a task's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for a crawl slot.
    Pending,
    /// Crawling or draining.
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether a run is queued or in progress.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one task id across its runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    /// Identifies the current run in logs and outcomes.
    pub run_id: Uuid,
    pub status: TaskStatus,
    /// Number of accepted requests.
    pub run_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Items written by the last finished run.
    pub items_written: usize,
    pub last_error: Option<String>,
}

impl TaskRecord {
    /// A fresh record with its first run queued.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            run_id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            run_count: 1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            items_written: 0,
            last_error: None,
        }
    }

    /// Queue another run. Fails if one is still active.
    pub fn requeue(&mut self) -> Result<()> {
        if self.status.is_active() {
            return Err(Error::TaskAlreadyRunning(self.task_id.clone()));
        }
        self.status = TaskStatus::Pending;
        self.run_id = Uuid::new_v4();
        self.run_count += 1;
        self.started_at = None;
        self.finished_at = None;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(Error::invalid_transition(self.status, TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Close the active run with its outcome.
    pub fn finish(&mut self, items_written: usize, error: Option<String>) {
        self.status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        self.items_written = items_written;
        self.last_error = error;
        self.finished_at = Some(Utc::now());
    }
}

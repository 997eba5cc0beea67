//! Barrage record.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat line captured from a live room.
///
/// Records sort by `(timestamp, id)`. Equality uses the same key, so a line a
/// platform resent with edited content still counts as the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barrage {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    /// When the platform says the line was sent.
    pub timestamp: DateTime<Utc>,
}

impl Barrage {
    /// A record stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            username: username.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn sent_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn key(&self) -> (&DateTime<Utc>, &str) {
        (&self.timestamp, &self.id)
    }
}

impl Ord for Barrage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Barrage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Barrage {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Barrage {}

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Outcome attached to an activity entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Info,
}

/// One audit-trail line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActivityEntry {
    pub message: String,
    pub status: ActivityStatus,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// Append-only audit trail of ledger, pool and chain events.
/// Every entry is mirrored to the process log.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Vec<ActivityEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        ActivityLog::default()
    }

    pub fn record(&mut self, message: impl Into<String>, status: ActivityStatus) {
        let message = message.into();

        match status {
            ActivityStatus::Success => info!("{}", message),
            ActivityStatus::Error => warn!("{}", message),
            ActivityStatus::Info => debug!("{}", message),
        }

        self.entries.push(ActivityEntry {
            message,
            status,
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.record(message, ActivityStatus::Success);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(message, ActivityStatus::Error);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(message, ActivityStatus::Info);
    }

    /// All entries, newest first
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    /// Up to `limit` entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

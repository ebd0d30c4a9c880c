//! Analysis queue entry model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timestamp::{serde_timestamp, serde_timestamp_opt};

/// Lifecycle of a queue entry.
///
/// `queued -> processing -> completed`, or back to `queued` after a failed
/// attempt while attempts remain, or `failed` once they are exhausted.
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown queue status: {s}")),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable work item routing one entity to the analysis service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisQueueEntry {
    pub id: String,
    /// Entity awaiting analysis; unique across the queue
    pub entity_id: String,
    pub status: QueueStatus,
    /// Number of processing attempts started; never decreases
    pub attempts: u32,
    /// Earliest pickup time (backoff schedule)
    #[serde(with = "serde_timestamp")]
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(with = "serde_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "serde_timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// Per-status entry counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Result of a startup lease recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Snapshot of an entry for API consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntryView {
    pub entity_id: String,
    pub status: QueueStatus,
    pub attempts: u32,
    #[serde(with = "serde_timestamp_opt")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<AnalysisQueueEntry> for QueueEntryView {
    fn from(entry: AnalysisQueueEntry) -> Self {
        let next_attempt_at = (entry.status == QueueStatus::Queued).then_some(entry.available_at);
        Self {
            entity_id: entry.entity_id,
            status: entry.status,
            attempts: entry.attempts,
            next_attempt_at,
            last_error: entry.last_error,
        }
    }
}

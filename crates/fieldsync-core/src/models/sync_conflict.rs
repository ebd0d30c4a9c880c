//! Sync conflict model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::timestamp::serde_timestamp;

/// An incoming change discarded by last-write-wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Collection of the discarded record
    pub collection: String,
    /// Record involved in the conflict
    pub record_id: String,
    /// Stored record's timestamp, which won
    #[serde(with = "serde_timestamp")]
    pub stored_modified_at: DateTime<Utc>,
    /// Incoming record's timestamp, which was rejected
    #[serde(with = "serde_timestamp")]
    pub incoming_modified_at: DateTime<Utc>,
    /// Caller that submitted the discarded change
    pub submitted_by: String,
    #[serde(with = "serde_timestamp")]
    pub resolved_at: DateTime<Utc>,
}

//! Patient model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{new_record_id, SyncEntity, SyncStatus};
use super::timestamp::{now, serde_timestamp};

/// A patient registered by a field worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    #[serde(default = "new_record_id")]
    pub id: String,
    /// Owning field worker
    pub chw_id: String,
    /// Demographics document (JSON text)
    pub demographics: String,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default = "now", with = "serde_timestamp")]
    pub last_modified_at: DateTime<Utc>,
}

impl SyncEntity for Patient {
    const COLLECTION: &'static str = "patients";
    const COLUMNS: &'static [&'static str] = &["chw_id", "demographics"];
    const STRUCTURED_FIELDS: &'static [&'static str] = &["demographics"];
    const STAMPS_OWNER: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn owner_id(&self) -> Option<&str> {
        Some(&self.chw_id)
    }
}

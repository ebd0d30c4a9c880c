//! Vitals model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{new_record_id, SyncEntity, SyncStatus};
use super::timestamp::{now, serde_timestamp};

/// A set of vital signs taken during a visit. Values are free text as
/// entered in the field (e.g. `98.6°F`, `120/80`, `70kg`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vitals {
    #[serde(default = "new_record_id")]
    pub id: String,
    pub patient_id: String,
    pub chw_id: String,
    pub temperature: String,
    pub blood_pressure: String,
    pub weight: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default = "now", with = "serde_timestamp")]
    pub last_modified_at: DateTime<Utc>,
}

impl SyncEntity for Vitals {
    const COLLECTION: &'static str = "vitals";
    const COLUMNS: &'static [&'static str] = &[
        "patient_id",
        "chw_id",
        "temperature",
        "blood_pressure",
        "weight",
        "notes",
    ];

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

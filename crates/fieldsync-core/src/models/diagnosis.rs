//! Diagnosis model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{new_record_id, SyncEntity, SyncStatus};
use super::timestamp::{now, serde_timestamp};

/// A clinician's diagnosis for a case. Owned by the reviewing doctor rather
/// than a field worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default = "new_record_id")]
    pub id: String,
    pub case_id: String,
    pub doctor_id: String,
    pub diagnosis_text: String,
    /// Prescription document (JSON text)
    #[serde(default)]
    pub prescription: Option<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default = "now", with = "serde_timestamp")]
    pub last_modified_at: DateTime<Utc>,
}

impl SyncEntity for Diagnosis {
    const COLLECTION: &'static str = "diagnoses";
    const COLUMNS: &'static [&'static str] = &["case_id", "doctor_id", "diagnosis_text", "prescription"];
    const STRUCTURED_FIELDS: &'static [&'static str] = &["prescription"];

    fn id(&self) -> &str {
        &self.id
    }

    fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }
}

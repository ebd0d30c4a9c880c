//! Triage case model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{is_high_risk, new_record_id, SyncEntity, SyncStatus};
use super::timestamp::{now, serde_timestamp};

/// Workflow status of a case
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    /// Triaged by the field worker, no analysis requested
    #[default]
    Triaged,
    /// High-risk case waiting for the analysis service
    AwaitingAnalysis,
    /// Analysis result available, waiting for a clinician
    PendingDiagnosis,
    /// Last analysis attempt failed
    AnalysisFailed,
    /// A clinician recorded a diagnosis
    Diagnosed,
}

impl CaseStatus {
    /// Wire and storage name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triaged => "TRIAGED",
            Self::AwaitingAnalysis => "AWAITING_ANALYSIS",
            Self::PendingDiagnosis => "PENDING_DIAGNOSIS",
            Self::AnalysisFailed => "ANALYSIS_FAILED",
            Self::Diagnosed => "DIAGNOSED",
        }
    }
}

/// A triage case captured in the field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default = "new_record_id")]
    pub id: String,
    pub patient_id: String,
    /// Owning field worker
    pub chw_id: String,
    /// Triage questionnaire answers (JSON text)
    pub triage_data: String,
    /// Latest analysis result or failure marker (JSON text)
    #[serde(default)]
    pub ai_analysis: Option<String>,
    #[serde(default)]
    pub status: CaseStatus,
    pub risk_level: String,
    /// Image references (JSON text)
    #[serde(default)]
    pub image_urls: Option<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default = "now", with = "serde_timestamp")]
    pub last_modified_at: DateTime<Utc>,
}

impl SyncEntity for Case {
    const COLLECTION: &'static str = "cases";
    const COLUMNS: &'static [&'static str] = &[
        "patient_id",
        "chw_id",
        "triage_data",
        "ai_analysis",
        "status",
        "risk_level",
        "image_urls",
    ];
    const STRUCTURED_FIELDS: &'static [&'static str] = &["triage_data", "image_urls", "ai_analysis"];
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

    fn requires_analysis(&self) -> bool {
        is_high_risk(&self.risk_level)
    }
}

//! Data models for FieldSync

mod case;
mod diagnosis;
mod entity;
mod patient;
mod queue_entry;
mod role;
mod sync_conflict;
pub mod timestamp;
mod vitals;

pub use case::{Case, CaseStatus};
pub use diagnosis::Diagnosis;
pub use entity::{is_high_risk, new_record_id, StoredRecord, SyncEntity, SyncStatus, OWNER_FIELD};
pub use patient::Patient;
pub use queue_entry::{
    AnalysisQueueEntry, QueueEntryView, QueueStats, QueueStatus, RecoveryReport,
};
pub use role::Role;
pub use sync_conflict::SyncConflict;
pub use vitals::Vitals;

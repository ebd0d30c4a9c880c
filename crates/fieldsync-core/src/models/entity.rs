//! Shared shape of every syncable record

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timestamp::serde_timestamp;

/// Wire and storage name of the owning field worker.
pub const OWNER_FIELD: &str = "chw_id";

/// Informational sync marker carried by every record. Not used when merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    New,
    Synced,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Synced => "synced",
        }
    }
}

/// A record type that participates in reconciliation.
///
/// Implementations are plain serde structs in storage form: structured
/// fields hold their serialized JSON text. The repository projects them
/// to and from SQL rows through their serde field map, so adding a
/// collection means adding a struct, its table, and a registry entry.
pub trait SyncEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name on the wire, also the table name.
    const COLLECTION: &'static str;

    /// Payload columns beyond `id`, `sync_status` and `last_modified_at`.
    const COLUMNS: &'static [&'static str];

    /// Columns holding JSON text in storage and native JSON on the wire.
    const STRUCTURED_FIELDS: &'static [&'static str] = &[];

    /// Whether a missing owner is filled in with the syncing caller.
    const STAMPS_OWNER: bool = false;

    fn id(&self) -> &str;

    fn last_modified_at(&self) -> DateTime<Utc>;

    fn sync_status(&self) -> SyncStatus;

    fn owner_id(&self) -> Option<&str> {
        None
    }

    /// Whether this record should be routed to the analysis queue.
    fn requires_analysis(&self) -> bool {
        false
    }
}

/// A record as held by the server, with server-managed bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRecord<E> {
    #[serde(flatten)]
    pub record: E,
    /// Set on first insert, never overwritten
    #[serde(with = "serde_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Server wall-clock time of the last applied write
    #[serde(with = "serde_timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// Generate a new record identifier (UUID v7, time-sortable).
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

/// Risk classification that routes a case to analysis.
pub fn is_high_risk(risk_level: &str) -> bool {
    risk_level.trim().eq_ignore_ascii_case("high")
}

//! Reconciliation of offline client changes with the server store.
//!
//! A sync call applies every submitted collection under last-write-wins inside
//! one `BEGIN IMMEDIATE` transaction, queues qualifying cases for analysis in
//! that same transaction, and then returns everything modified since the
//! caller's previous sync.

mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::db::{Database, QueueRepository};
use crate::error::{Error, Result};
use crate::models::timestamp::{now, serde_timestamp, serde_timestamp_opt};
use crate::util::user_fingerprint;

pub use registry::{ApplyReport, Collection, CollectionHandler, CollectionRegistry};

/// Inbound sync body
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SyncRequest {
    /// `new_sync_timestamp` from the caller's previous sync
    #[serde(default, with = "serde_timestamp_opt")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Candidate records keyed by collection name
    #[serde(default)]
    pub changes: Map<String, Value>,
}

impl SyncRequest {
    /// Parse a request body, reporting shape problems as validation errors.
    pub fn from_json(body: Value) -> Result<Self> {
        if body.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(body)
            .map_err(|err| Error::validation(format!("invalid sync request: {err}")))
    }
}

/// Outbound sync body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResponse {
    /// Server time to present as `last_sync_timestamp` next time
    #[serde(with = "serde_timestamp")]
    pub new_sync_timestamp: DateTime<Utc>,
    /// Wire records per collection; empty collections are omitted
    pub server_updates: BTreeMap<String, Vec<Value>>,
}

/// Reconciliation engine
#[derive(Clone)]
pub struct SyncService {
    db: Database,
    registry: Arc<CollectionRegistry>,
    work_available: Arc<Notify>,
}

impl SyncService {
    pub fn new(db: Database, work_available: Arc<Notify>) -> Self {
        Self::with_registry(db, CollectionRegistry::default(), work_available)
    }

    pub fn with_registry(
        db: Database,
        registry: CollectionRegistry,
        work_available: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            registry: Arc::new(registry),
            work_available,
        }
    }

    /// Apply a batch of client changes and compute the caller's delta.
    ///
    /// All-or-nothing: any validation or storage failure rolls back every
    /// collection and every queue insertion of the batch.
    pub async fn reconcile(&self, request: SyncRequest, caller: &str) -> Result<SyncResponse> {
        let SyncRequest {
            last_sync_timestamp,
            mut changes,
        } = request;

        let mut conn = self.db.lock().await;
        let applied_at = now();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut totals = ApplyReport::default();
        for handler in self.registry.handlers() {
            let records = match changes.remove(handler.name()) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(records)) => records,
                Some(_) => {
                    return Err(Error::validation(format!(
                        "changes.{} must be an array",
                        handler.name()
                    )))
                }
            };
            let report = handler.apply(&tx, records, caller, applied_at)?;
            totals.inserted += report.inserted;
            totals.updated += report.updated;
            totals.discarded += report.discarded;
            totals.analysis_candidates.extend(report.analysis_candidates);
        }
        for ignored in changes.keys() {
            tracing::debug!(collection = %ignored, "Ignoring unknown collection");
        }

        let queue = QueueRepository::new(&tx);
        let mut enqueued = 0_usize;
        let mut seen = BTreeSet::new();
        for case_id in &totals.analysis_candidates {
            if seen.insert(case_id.as_str()) && queue.enqueue(case_id, applied_at)? {
                tracing::info!(case_id = %case_id, "Queued case for analysis");
                enqueued += 1;
            }
        }

        tx.commit()?;

        let new_sync_timestamp = now();
        let mut server_updates = BTreeMap::new();
        for handler in self.registry.handlers() {
            let updates = handler.changed_since(&conn, last_sync_timestamp)?;
            if !updates.is_empty() {
                server_updates.insert(handler.name().to_string(), updates);
            }
        }
        drop(conn);

        if enqueued > 0 {
            self.work_available.notify_one();
        }

        tracing::info!(
            user = user_fingerprint(caller),
            inserted = totals.inserted,
            updated = totals.updated,
            discarded = totals.discarded,
            enqueued,
            "Reconciled sync batch"
        );

        Ok(SyncResponse {
            new_sync_timestamp,
            server_updates,
        })
    }
}

//! Collection registry: maps wire collection names to typed handlers

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::db::{CollectionRepository, ConflictLog, UpsertOutcome};
use crate::error::{Error, Result};
use crate::models::{Case, Diagnosis, Patient, SyncEntity, Vitals, OWNER_FIELD};
use crate::normalize::{normalize_record, wire_record};
use crate::util::user_fingerprint;

/// Counts from applying one collection's candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub discarded: usize,
    /// Ids of candidates that qualify for analysis, in submission order
    pub analysis_candidates: Vec<String>,
}

/// Type-erased access to one collection
pub trait CollectionHandler: Send + Sync {
    /// Wire name of the collection
    fn name(&self) -> &'static str;

    /// Apply wire candidates in order under last-write-wins.
    fn apply(
        &self,
        conn: &Connection,
        records: Vec<Value>,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<ApplyReport>;

    /// Wire records modified strictly after `since`, oldest first.
    fn changed_since(&self, conn: &Connection, since: Option<DateTime<Utc>>) -> Result<Vec<Value>>;
}

/// Handler for entity type `E`
pub struct Collection<E>(PhantomData<fn() -> E>);

impl<E> Collection<E> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for Collection<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SyncEntity> CollectionHandler for Collection<E> {
    fn name(&self) -> &'static str {
        E::COLLECTION
    }

    fn apply(
        &self,
        conn: &Connection,
        records: Vec<Value>,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<ApplyReport> {
        let repo = CollectionRepository::<E>::new(conn);
        let conflicts = ConflictLog::new(conn);
        let mut report = ApplyReport::default();

        for (index, candidate) in records.into_iter().enumerate() {
            let (record, supplied) = prepare::<E>(candidate, caller)
                .map_err(|err| Error::validation(format!("{}[{index}]: {err}", E::COLLECTION)))?;

            match repo.upsert_columns(&record, &supplied, now)? {
                UpsertOutcome::Inserted => {
                    tracing::debug!(collection = E::COLLECTION, record_id = %record.id(), "Inserted record");
                    report.inserted += 1;
                }
                UpsertOutcome::Updated => {
                    tracing::debug!(collection = E::COLLECTION, record_id = %record.id(), "Updated record");
                    report.updated += 1;
                }
                UpsertOutcome::Discarded { stored_modified_at } => {
                    tracing::warn!(
                        collection = E::COLLECTION,
                        record_id = %record.id(),
                        user = user_fingerprint(caller),
                        "Discarded stale change"
                    );
                    conflicts.record(
                        E::COLLECTION,
                        record.id(),
                        stored_modified_at,
                        record.last_modified_at(),
                        caller,
                        now,
                    )?;
                    report.discarded += 1;
                }
            }

            if record.requires_analysis() {
                report.analysis_candidates.push(record.id().to_string());
            }
        }

        Ok(report)
    }

    fn changed_since(&self, conn: &Connection, since: Option<DateTime<Utc>>) -> Result<Vec<Value>> {
        CollectionRepository::<E>::new(conn)
            .modified_since(since)?
            .iter()
            .map(wire_record)
            .collect()
    }
}

/// Turn one wire candidate into a typed storage-form record, along with the
/// payload columns the candidate actually carried.
fn prepare<E: SyncEntity>(candidate: Value, caller: &str) -> Result<(E, Vec<&'static str>)> {
    let Value::Object(mut map) = candidate else {
        return Err(Error::validation("record must be a JSON object"));
    };

    normalize_record(&mut map, E::STRUCTURED_FIELDS)?;
    drop_nulls(&mut map, &["id", "last_modified_at", "sync_status"]);

    if E::STAMPS_OWNER && matches!(map.get(OWNER_FIELD), None | Some(Value::Null)) {
        map.insert(OWNER_FIELD.to_string(), Value::String(caller.to_string()));
    }
    if matches!(map.get("id"), Some(Value::String(id)) if id.trim().is_empty()) {
        return Err(Error::validation("`id` must not be empty"));
    }

    let supplied = E::COLUMNS
        .iter()
        .copied()
        .filter(|column| map.contains_key(*column))
        .collect();
    let record = serde_json::from_value(Value::Object(map)).map_err(|err| Error::validation(err.to_string()))?;
    Ok((record, supplied))
}

/// Explicit nulls on defaulted fields mean "not supplied".
fn drop_nulls(map: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if matches!(map.get(*field), Some(Value::Null)) {
            map.remove(*field);
        }
    }
}

/// Registered collections in apply order
pub struct CollectionRegistry {
    handlers: Vec<Box<dyn CollectionHandler>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Register a collection; later registrations apply later.
    #[must_use]
    pub fn register<E: SyncEntity>(mut self) -> Self {
        self.handlers.push(Box::new(Collection::<E>::new()));
        self
    }

    pub fn handlers(&self) -> impl Iterator<Item = &dyn CollectionHandler> {
        self.handlers.iter().map(|handler| &**handler)
    }
}

impl Default for CollectionRegistry {
    /// Patients before the cases, diagnoses and vitals that reference them.
    fn default() -> Self {
        Self::new()
            .register::<Patient>()
            .register::<Case>()
            .register::<Diagnosis>()
            .register::<Vitals>()
    }
}

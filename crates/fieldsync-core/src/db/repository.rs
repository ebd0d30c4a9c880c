//! Generic collection repository
//!
//! One implementation serves every [`SyncEntity`]: records are projected to
//! rows through their serde field map, so the repository only needs the
//! entity's collection name and payload column list.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::timestamp::{format_timestamp, from_micros, to_micros};
use crate::models::{StoredRecord, SyncEntity};

/// Shared columns every collection table carries, in select order.
const META_COLUMNS: [&str; 5] = [
    "id",
    "sync_status",
    "last_modified_at",
    "created_at",
    "updated_at",
];

/// What a last-write-wins upsert did with the candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No stored record with this id existed
    Inserted,
    /// Candidate was strictly newer and replaced the stored record
    Updated,
    /// Candidate was not newer; stored record untouched
    Discarded { stored_modified_at: DateTime<Utc> },
}

/// Repository for one collection, bound to a connection or open transaction
pub struct CollectionRepository<'a, E> {
    conn: &'a Connection,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: SyncEntity> CollectionRepository<'a, E> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            _entity: PhantomData,
        }
    }

    /// Get a record by id
    pub fn get(&self, id: &str) -> Result<Option<StoredRecord<E>>> {
        let sql = format!("{} WHERE id = ?1", select_sql::<E>());
        let raw = self
            .conn
            .query_row(&sql, params![id], RawRow::read::<E>)
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    /// Apply a candidate under last-write-wins, overwriting every column.
    pub fn upsert(&self, record: &E, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        self.upsert_columns(record, E::COLUMNS, now)
    }

    /// Apply a candidate under last-write-wins.
    ///
    /// A winning overwrite only touches the payload columns in `supplied`;
    /// the rest keep their stored values. An insert writes every column.
    /// The overwrite is a compare-and-swap on the timestamp read just before
    /// it, so a concurrent writer that got in between turns this write into a
    /// discard instead of a lost update.
    pub fn upsert_columns(
        &self,
        record: &E,
        supplied: &[&str],
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let Some(stored) = self.stored_modified_at(record.id())? else {
            self.insert(record, now)?;
            return Ok(UpsertOutcome::Inserted);
        };

        let incoming = to_micros(&record.last_modified_at());
        if incoming <= stored {
            return Ok(UpsertOutcome::Discarded {
                stored_modified_at: decode_micros(stored)?,
            });
        }

        let columns = E::COLUMNS
            .iter()
            .copied()
            .filter(|column| supplied.contains(column))
            .collect::<Vec<_>>();
        let assignments = columns
            .iter()
            .map(|column| format!(", {column} = ?"))
            .collect::<String>();
        let sql = format!(
            "UPDATE {} SET sync_status = ?, last_modified_at = ?, updated_at = ?{assignments}
             WHERE id = ? AND last_modified_at = ?",
            E::COLLECTION
        );

        let mut values = vec![
            SqlValue::Text(record.sync_status().as_str().to_string()),
            SqlValue::Integer(incoming),
            SqlValue::Integer(to_micros(&now)),
        ];
        values.extend(payload_values(record, &columns)?);
        values.push(SqlValue::Text(record.id().to_string()));
        values.push(SqlValue::Integer(stored));

        let changed = self.conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            let current = self.stored_modified_at(record.id())?.unwrap_or(stored);
            return Ok(UpsertOutcome::Discarded {
                stored_modified_at: decode_micros(current)?,
            });
        }
        Ok(UpsertOutcome::Updated)
    }

    /// Write a record unconditionally, keeping `created_at` if it exists.
    ///
    /// Used for server-side mutations, which stamp their own wall-clock time.
    pub fn put(&self, record: &E, now: DateTime<Utc>) -> Result<()> {
        let updates = E::COLUMNS
            .iter()
            .map(|column| format!(", {column} = excluded.{column}"))
            .collect::<String>();
        let sql = format!(
            "{} ON CONFLICT(id) DO UPDATE SET sync_status = excluded.sync_status,
             last_modified_at = excluded.last_modified_at, updated_at = excluded.updated_at{updates}",
            insert_sql::<E>()
        );
        self.conn
            .execute(&sql, params_from_iter(insert_values(record, now)?))?;
        Ok(())
    }

    /// Records with `last_modified_at` strictly after `since` (all when `None`),
    /// oldest first
    pub fn modified_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<StoredRecord<E>>> {
        let mut sql = select_sql::<E>();
        let mut values = Vec::new();
        if let Some(since) = since {
            sql.push_str(" WHERE last_modified_at > ?1");
            values.push(to_micros(&since));
        }
        sql.push_str(" ORDER BY last_modified_at ASC, id ASC");
        self.collect(&sql, params_from_iter(values))
    }

    /// Records whose payload column equals `value`, oldest first
    pub fn find_by(&self, column: &str, value: &str) -> Result<Vec<StoredRecord<E>>> {
        check_column::<E>(column)?;
        let sql = format!(
            "{} WHERE {column} = ?1 ORDER BY last_modified_at ASC, id ASC",
            select_sql::<E>()
        );
        self.collect(&sql, params![value])
    }

    /// Records whose payload column is any of `values`, oldest first
    pub fn find_in(&self, column: &str, values: &[&str]) -> Result<Vec<StoredRecord<E>>> {
        check_column::<E>(column)?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "{} WHERE {column} IN ({placeholders}) ORDER BY last_modified_at ASC, id ASC",
            select_sql::<E>()
        );
        self.collect(&sql, params_from_iter(values.iter()))
    }

    fn insert(&self, record: &E, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(&insert_sql::<E>(), params_from_iter(insert_values(record, now)?))?;
        Ok(())
    }

    fn stored_modified_at(&self, id: &str) -> Result<Option<i64>> {
        let sql = format!("SELECT last_modified_at FROM {} WHERE id = ?1", E::COLLECTION);
        Ok(self
            .conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?)
    }

    fn collect(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredRecord<E>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawRow::read::<E>)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRow::into_record).collect()
    }
}

fn check_column<E: SyncEntity>(column: &str) -> Result<()> {
    if E::COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "unknown column `{column}` for {}",
            E::COLLECTION
        )))
    }
}

/// Row as read from SQLite, before conversion into a typed record
struct RawRow {
    id: String,
    sync_status: String,
    last_modified_at: i64,
    created_at: i64,
    updated_at: i64,
    payload: Vec<(&'static str, Option<String>)>,
}

impl RawRow {
    fn read<E: SyncEntity>(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let payload = E::COLUMNS
            .iter()
            .enumerate()
            .map(|(offset, column)| -> rusqlite::Result<_> {
                Ok((*column, row.get(META_COLUMNS.len() + offset)?))
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self {
            id: row.get(0)?,
            sync_status: row.get(1)?,
            last_modified_at: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            payload,
        })
    }

    fn into_record<E: SyncEntity>(self) -> Result<StoredRecord<E>> {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id));
        map.insert("sync_status".into(), Value::String(self.sync_status));
        map.insert(
            "last_modified_at".into(),
            Value::String(format_timestamp(&decode_micros(self.last_modified_at)?)),
        );
        for (column, value) in self.payload {
            map.insert(column.to_string(), value.map_or(Value::Null, Value::String));
        }

        Ok(StoredRecord {
            record: serde_json::from_value(Value::Object(map))?,
            created_at: decode_micros(self.created_at)?,
            updated_at: decode_micros(self.updated_at)?,
        })
    }
}

fn select_sql<E: SyncEntity>() -> String {
    let columns = META_COLUMNS
        .iter()
        .chain(E::COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM {}", E::COLLECTION)
}

fn insert_sql<E: SyncEntity>() -> String {
    let columns = META_COLUMNS
        .iter()
        .chain(E::COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        E::COLLECTION,
        columns.join(", ")
    )
}

fn insert_values<E: SyncEntity>(record: &E, now: DateTime<Utc>) -> Result<Vec<SqlValue>> {
    let now = to_micros(&now);
    let mut values = vec![
        SqlValue::Text(record.id().to_string()),
        SqlValue::Text(record.sync_status().as_str().to_string()),
        SqlValue::Integer(to_micros(&record.last_modified_at())),
        SqlValue::Integer(now),
        SqlValue::Integer(now),
    ];
    values.extend(payload_values(record, E::COLUMNS)?);
    Ok(values)
}

/// Field-map projection of the given payload columns, in that order
fn payload_values<E: SyncEntity>(record: &E, columns: &[&str]) -> Result<Vec<SqlValue>> {
    let Value::Object(map) = serde_json::to_value(record)? else {
        return Err(Error::validation(format!(
            "{} record does not serialize to an object",
            E::COLLECTION
        )));
    };
    Ok(columns
        .iter()
        .map(|column| match map.get(*column) {
            None | Some(Value::Null) => SqlValue::Null,
            Some(Value::String(text)) => SqlValue::Text(text.clone()),
            Some(other) => SqlValue::Text(other.to_string()),
        })
        .collect())
}

fn decode_micros(micros: i64) -> Result<DateTime<Utc>> {
    from_micros(micros).ok_or_else(|| Error::Database(format!("stored timestamp out of range: {micros}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timestamp::parse_timestamp;
    use crate::models::{Case, CaseStatus, Patient, SyncStatus, Vitals};
    use pretty_assertions::assert_eq;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::run(&mut conn).unwrap();
        conn
    }

    fn ts(value: &str) -> DateTime<Utc> {
        parse_timestamp(value).unwrap()
    }

    fn case(id: &str, risk: &str, modified: &str) -> Case {
        Case {
            id: id.into(),
            patient_id: "p1".into(),
            chw_id: "chw-1".into(),
            triage_data: r#"{"fever":true}"#.into(),
            ai_analysis: None,
            status: CaseStatus::Triaged,
            risk_level: risk.into(),
            image_urls: Some(r#"["a.jpg"]"#.into()),
            sync_status: SyncStatus::New,
            last_modified_at: ts(modified),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup();
        let repo = CollectionRepository::<Case>::new(&conn);
        let now = ts("2024-02-01T00:00:00Z");

        let outcome = repo.upsert(&case("c1", "high", "2024-01-01T00:00:00Z"), now).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let stored = repo.get("c1").unwrap().unwrap();
        assert_eq!(stored.record, case("c1", "high", "2024-01-01T00:00:00Z"));
        assert_eq!(stored.created_at, now);
        assert_eq!(stored.updated_at, now);
        assert!(repo.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_newer_candidate_overwrites_everything_but_created_at() {
        let conn = setup();
        let repo = CollectionRepository::<Case>::new(&conn);
        let first_write = ts("2024-02-01T00:00:00Z");
        let second_write = ts("2024-02-02T00:00:00Z");

        repo.upsert(&case("c1", "low", "2024-01-01T00:00:00Z"), first_write)
            .unwrap();
        let mut newer = case("c1", "high", "2024-01-02T00:00:00Z");
        newer.image_urls = None;
        assert_eq!(repo.upsert(&newer, second_write).unwrap(), UpsertOutcome::Updated);

        let stored = repo.get("c1").unwrap().unwrap();
        assert_eq!(stored.record, newer);
        assert_eq!(stored.created_at, first_write);
        assert_eq!(stored.updated_at, second_write);
    }

    #[test]
    fn test_partial_overwrite_keeps_unsupplied_columns() {
        let conn = setup();
        let repo = CollectionRepository::<Case>::new(&conn);
        let now = ts("2024-02-01T00:00:00Z");

        let mut analyzed = case("c1", "high", "2024-01-01T00:00:00Z");
        analyzed.ai_analysis = Some(r#"{"analysis":{"score":4}}"#.into());
        analyzed.status = CaseStatus::PendingDiagnosis;
        repo.put(&analyzed, now).unwrap();

        let mut resubmitted = case("c1", "high", "2024-01-05T00:00:00Z");
        resubmitted.triage_data = r#"{"fever":false}"#.into();
        let supplied = ["patient_id", "chw_id", "triage_data", "risk_level", "image_urls"];
        assert_eq!(
            repo.upsert_columns(&resubmitted, &supplied, now).unwrap(),
            UpsertOutcome::Updated
        );

        let stored = repo.get("c1").unwrap().unwrap().record;
        assert_eq!(stored.triage_data, r#"{"fever":false}"#);
        assert_eq!(stored.last_modified_at, ts("2024-01-05T00:00:00Z"));
        assert_eq!(stored.status, CaseStatus::PendingDiagnosis);
        assert_eq!(stored.ai_analysis, analyzed.ai_analysis);
    }

    #[test]
    fn test_older_or_equal_candidate_is_discarded() {
        let conn = setup();
        let repo = CollectionRepository::<Case>::new(&conn);
        let now = ts("2024-02-01T00:00:00Z");
        let original = case("c1", "high", "2024-01-02T00:00:00Z");
        repo.upsert(&original, now).unwrap();

        for stale in ["2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z"] {
            let outcome = repo.upsert(&case("c1", "low", stale), now).unwrap();
            assert_eq!(
                outcome,
                UpsertOutcome::Discarded {
                    stored_modified_at: ts("2024-01-02T00:00:00Z")
                }
            );
        }
        assert_eq!(repo.get("c1").unwrap().unwrap().record, original);
    }

    #[test]
    fn test_apply_order_does_not_matter() {
        let r1 = case("c1", "low", "2024-01-01T00:00:00Z");
        let r2 = case("c1", "high", "2024-01-03T00:00:00Z");
        let now = ts("2024-02-01T00:00:00Z");

        let forward = setup();
        let repo = CollectionRepository::<Case>::new(&forward);
        repo.upsert(&r1, now).unwrap();
        repo.upsert(&r2, now).unwrap();
        let forward_record = repo.get("c1").unwrap().unwrap().record;

        let backward = setup();
        let repo = CollectionRepository::<Case>::new(&backward);
        repo.upsert(&r2, now).unwrap();
        repo.upsert(&r1, now).unwrap();
        let backward_record = repo.get("c1").unwrap().unwrap().record;

        assert_eq!(forward_record, backward_record);
        assert_eq!(forward_record, r2);
    }

    #[test]
    fn test_modified_since_is_strict_and_ordered() {
        let conn = setup();
        let repo = CollectionRepository::<Case>::new(&conn);
        let now = ts("2024-02-01T00:00:00Z");
        repo.upsert(&case("c3", "low", "2024-01-03T00:00:00Z"), now).unwrap();
        repo.upsert(&case("c1", "low", "2024-01-01T00:00:00Z"), now).unwrap();
        repo.upsert(&case("c2", "low", "2024-01-02T00:00:00Z"), now).unwrap();

        let all = repo.modified_since(None).unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let since = repo.modified_since(Some(ts("2024-01-02T00:00:00Z"))).unwrap();
        let ids: Vec<_> = since.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["c3"]);
    }

    #[test]
    fn test_put_overrides_newer_stored_timestamp() {
        let conn = setup();
        let repo = CollectionRepository::<Patient>::new(&conn);
        let created = ts("2024-02-01T00:00:00Z");
        let patient = Patient {
            id: "p1".into(),
            chw_id: "chw-1".into(),
            demographics: r#"{"name":"A"}"#.into(),
            sync_status: SyncStatus::New,
            last_modified_at: ts("2030-01-01T00:00:00Z"),
        };
        repo.put(&patient, created).unwrap();

        let mut server_edit = patient.clone();
        server_edit.demographics = r#"{"name":"B"}"#.into();
        server_edit.last_modified_at = ts("2024-03-01T00:00:00Z");
        repo.put(&server_edit, ts("2024-03-01T00:00:00Z")).unwrap();

        let stored = repo.get("p1").unwrap().unwrap();
        assert_eq!(stored.record, server_edit);
        assert_eq!(stored.created_at, created);
    }

    #[test]
    fn test_find_by_rejects_unknown_columns() {
        let conn = setup();
        let repo = CollectionRepository::<Vitals>::new(&conn);
        assert!(repo.find_by("patient_id", "p1").unwrap().is_empty());
        assert!(matches!(
            repo.find_by("1 = 1; DROP TABLE vitals; --", "x"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_find_in_matches_any_listed_value() {
        let conn = setup();
        let repo = CollectionRepository::<Case>::new(&conn);
        let now = ts("2024-02-01T00:00:00Z");
        let statuses = [
            ("c1", CaseStatus::Triaged),
            ("c2", CaseStatus::PendingDiagnosis),
            ("c3", CaseStatus::Diagnosed),
        ];
        for (id, status) in statuses {
            let mut record = case(id, "high", "2024-01-01T00:00:00Z");
            record.status = status;
            repo.put(&record, now).unwrap();
        }

        let open = repo
            .find_in(
                "status",
                &[CaseStatus::Triaged.as_str(), CaseStatus::PendingDiagnosis.as_str()],
            )
            .unwrap();
        let ids: Vec<_> = open.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(repo.find_in("status", &[]).unwrap().is_empty());
        assert!(matches!(repo.find_in("nope", &["x"]), Err(Error::Validation(_))));
    }
}

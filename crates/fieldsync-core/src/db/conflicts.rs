//! Log of incoming changes discarded by last-write-wins

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::timestamp::{from_micros, to_micros};
use crate::models::SyncConflict;

/// Append-only conflict log
pub struct ConflictLog<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record one discarded candidate
    pub fn record(
        &self,
        collection: &str,
        record_id: &str,
        stored_modified_at: DateTime<Utc>,
        incoming_modified_at: DateTime<Utc>,
        submitted_by: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
                (collection, record_id, stored_modified_at, incoming_modified_at, submitted_by, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                collection,
                record_id,
                to_micros(&stored_modified_at),
                to_micros(&incoming_modified_at),
                submitted_by,
                to_micros(&resolved_at),
            ],
        )?;
        Ok(())
    }

    /// Conflicts recorded for one record, oldest first
    pub fn for_record(&self, collection: &str, record_id: &str) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection, record_id, stored_modified_at, incoming_modified_at,
                    submitted_by, resolved_at
             FROM sync_conflicts
             WHERE collection = ?1 AND record_id = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![collection, record_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, collection, record_id, stored, incoming, submitted_by, resolved)| -> Result<SyncConflict> {
                Ok(SyncConflict {
                    id,
                    collection,
                    record_id,
                    stored_modified_at: decode(stored)?,
                    incoming_modified_at: decode(incoming)?,
                    submitted_by,
                    resolved_at: decode(resolved)?,
                })
            })
            .collect()
    }
}

fn decode(micros: i64) -> Result<DateTime<Utc>> {
    from_micros(micros).ok_or_else(|| Error::Database(format!("stored timestamp out of range: {micros}")))
}

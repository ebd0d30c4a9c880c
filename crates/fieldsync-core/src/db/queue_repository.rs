//! Analysis queue storage
//!
//! Every transition is a conditional `UPDATE` on the entry's current status,
//! so a transition that lost a race reports `false` instead of clobbering
//! state. Callers hold the connection lock (and usually a transaction).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::timestamp::{from_micros, to_micros};
use crate::models::{new_record_id, AnalysisQueueEntry, QueueStats, QueueStatus, RecoveryReport};

const SELECT_ENTRY: &str = "SELECT id, entity_id, status, attempts, available_at, last_error,
                                   created_at, updated_at
                            FROM analysis_queue";

/// Queue storage bound to a connection or open transaction
pub struct QueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> QueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Queue an entity for analysis unless it already has an entry.
    ///
    /// Returns `true` when a new entry was created.
    pub fn enqueue(&self, entity_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now = to_micros(&now);
        let inserted = self.conn.execute(
            "INSERT INTO analysis_queue (id, entity_id, status, attempts, available_at, created_at, updated_at)
             VALUES (?1, ?2, 'queued', 0, ?3, ?3, ?3)
             ON CONFLICT(entity_id) DO NOTHING",
            params![new_record_id(), entity_id, now],
        )?;
        Ok(inserted > 0)
    }

    /// Get an entry by id
    pub fn get(&self, id: &str) -> Result<Option<AnalysisQueueEntry>> {
        self.query_one(&format!("{SELECT_ENTRY} WHERE id = ?1"), id)
    }

    /// Get the entry for an entity
    pub fn get_by_entity(&self, entity_id: &str) -> Result<Option<AnalysisQueueEntry>> {
        self.query_one(&format!("{SELECT_ENTRY} WHERE entity_id = ?1"), entity_id)
    }

    /// Ids of queued entries whose backoff has elapsed, earliest first
    pub fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id FROM analysis_queue
             WHERE status = 'queued' AND available_at <= ?1
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![to_micros(&now), limit], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// `queued -> processing`, counting the attempt.
    ///
    /// Returns the claimed entry, or `None` if it was not claimable.
    pub fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<AnalysisQueueEntry>> {
        let changed = self.conn.execute(
            "UPDATE analysis_queue
             SET status = 'processing', attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, to_micros(&now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// `processing -> completed`
    pub fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE analysis_queue
             SET status = 'completed', last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, to_micros(&now)],
        )?;
        Ok(changed > 0)
    }

    /// `processing -> queued`, eligible again at `available_at`
    pub fn requeue(
        &self,
        id: &str,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE analysis_queue
             SET status = 'queued', available_at = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, to_micros(&available_at), error, to_micros(&now)],
        )?;
        Ok(changed > 0)
    }

    /// `queued | processing -> failed`
    pub fn fail(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE analysis_queue
             SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE id = ?1 AND status IN ('queued', 'processing')",
            params![id, error, to_micros(&now)],
        )?;
        Ok(changed > 0)
    }

    /// Release leases held longer than `cutoff` by a worker that went away.
    ///
    /// Entries with attempts left return to `queued` immediately; the rest
    /// become `failed`.
    pub fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport> {
        let cutoff = to_micros(&cutoff);
        let now = to_micros(&now);
        let failed = self.conn.execute(
            "UPDATE analysis_queue
             SET status = 'failed', last_error = 'lease expired', updated_at = ?3
             WHERE status = 'processing' AND updated_at <= ?1 AND attempts >= ?2",
            params![cutoff, max_attempts, now],
        )?;
        let requeued = self.conn.execute(
            "UPDATE analysis_queue
             SET status = 'queued', available_at = ?3, last_error = 'lease expired', updated_at = ?3
             WHERE status = 'processing' AND updated_at <= ?1 AND attempts < ?2",
            params![cutoff, max_attempts, now],
        )?;
        Ok(RecoveryReport { requeued, failed })
    }

    /// Entry counts per status
    pub fn stats(&self) -> Result<QueueStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM analysis_queue GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<QueueStatus>().map_err(Error::Database)? {
                QueueStatus::Queued => stats.queued = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Completed => stats.completed = count,
                QueueStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<AnalysisQueueEntry>> {
        let raw = self
            .conn
            .query_row(sql, params![key], |row| {
                Ok(RawEntry {
                    id: row.get(0)?,
                    entity_id: row.get(1)?,
                    status: row.get(2)?,
                    attempts: row.get(3)?,
                    available_at: row.get(4)?,
                    last_error: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }
}

struct RawEntry {
    id: String,
    entity_id: String,
    status: String,
    attempts: u32,
    available_at: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawEntry {
    fn into_entry(self) -> Result<AnalysisQueueEntry> {
        Ok(AnalysisQueueEntry {
            id: self.id,
            entity_id: self.entity_id,
            status: self.status.parse().map_err(Error::Database)?,
            attempts: self.attempts,
            available_at: decode(self.available_at)?,
            last_error: self.last_error,
            created_at: decode(self.created_at)?,
            updated_at: decode(self.updated_at)?,
        })
    }
}

fn decode(micros: i64) -> Result<DateTime<Utc>> {
    from_micros(micros).ok_or_else(|| Error::Database(format!("stored timestamp out of range: {micros}")))
}

//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &mut Connection, version: i32, statements: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(statements)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: syncable collections, analysis queue, conflict log.
///
/// Timestamps are unix microseconds. Payload columns mirror each entity's
/// `SyncEntity::COLUMNS`.
const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS patients (
    id TEXT PRIMARY KEY,
    chw_id TEXT NOT NULL,
    demographics TEXT NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'new',
    last_modified_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patients_modified ON patients(last_modified_at);
CREATE INDEX IF NOT EXISTS idx_patients_chw ON patients(chw_id);

CREATE TABLE IF NOT EXISTS cases (
    id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    chw_id TEXT NOT NULL,
    triage_data TEXT NOT NULL,
    ai_analysis TEXT,
    status TEXT NOT NULL DEFAULT 'TRIAGED',
    risk_level TEXT NOT NULL,
    image_urls TEXT,
    sync_status TEXT NOT NULL DEFAULT 'new',
    last_modified_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cases_modified ON cases(last_modified_at);
CREATE INDEX IF NOT EXISTS idx_cases_patient ON cases(patient_id);

CREATE TABLE IF NOT EXISTS diagnoses (
    id TEXT PRIMARY KEY,
    case_id TEXT NOT NULL,
    doctor_id TEXT NOT NULL,
    diagnosis_text TEXT NOT NULL,
    prescription TEXT,
    sync_status TEXT NOT NULL DEFAULT 'new',
    last_modified_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_diagnoses_modified ON diagnoses(last_modified_at);
CREATE INDEX IF NOT EXISTS idx_diagnoses_case ON diagnoses(case_id);

CREATE TABLE IF NOT EXISTS vitals (
    id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    chw_id TEXT NOT NULL,
    temperature TEXT NOT NULL,
    blood_pressure TEXT NOT NULL,
    weight TEXT NOT NULL,
    notes TEXT,
    sync_status TEXT NOT NULL DEFAULT 'new',
    last_modified_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vitals_modified ON vitals(last_modified_at);
CREATE INDEX IF NOT EXISTS idx_vitals_patient ON vitals(patient_id);

CREATE TABLE IF NOT EXISTS analysis_queue (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'processing', 'completed', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    available_at INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_analysis_queue_ready ON analysis_queue(status, available_at);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    record_id TEXT NOT NULL,
    stored_modified_at INTEGER NOT NULL,
    incoming_modified_at INTEGER NOT NULL,
    submitted_by TEXT NOT NULL,
    resolved_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(collection, record_id);
";

/// Version 2: queue state-machine guards.
///
/// `attempts` may only grow and terminal entries may not change status.
const MIGRATION_V2: &str = "
CREATE TRIGGER IF NOT EXISTS analysis_queue_attempts_guard BEFORE UPDATE OF attempts ON analysis_queue
FOR EACH ROW
WHEN NEW.attempts < OLD.attempts
BEGIN
    SELECT RAISE(ABORT, 'analysis_queue.attempts must not decrease');
END;

CREATE TRIGGER IF NOT EXISTS analysis_queue_terminal_guard BEFORE UPDATE OF status ON analysis_queue
FOR EACH ROW
WHEN OLD.status IN ('completed', 'failed') AND NEW.status <> OLD.status
BEGIN
    SELECT RAISE(ABORT, 'analysis_queue entry is terminal');
END;
";

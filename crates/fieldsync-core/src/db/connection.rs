//! Database connection management

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

use super::migrations;
use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the server database.
///
/// A single connection behind an async mutex: every reconciliation and
/// every queue transition runs with exclusive access, and write transactions
/// are opened with `BEGIN IMMEDIATE` so the writer lock is held from the
/// first read.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        tracing::debug!("Opened database at {}", path.display());
        Ok(Self::wrap(conn))
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn configure(conn: &Connection) -> Result<()> {
        // WAL is unavailable for in-memory databases; the pragma then reports
        // "memory", which is fine.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }

    /// Acquire exclusive access to the connection.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock().await;
        let val: i32 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(val, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("fieldsync.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let conn = db.lock().await;
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'analysis_queue'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("fieldsync.db");
        drop(Database::open(&path).unwrap());
        assert!(Database::open(&path).is_ok());
    }
}

//! SQLite persistence for services, windows, tickets and daily resets.
//!
//! The database runs in WAL mode. All writes go through a single writer
//! connection guarded by a mutex, so at most one write transaction is in
//! flight per process. Pure reads are served by a small pool of reader
//! connections and never wait on the writer.

mod models;
mod resets;
mod schema;
mod services;
mod tickets;
mod windows;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;

use crate::clock::Clock;

pub use models::{
    DailyResetRecord, NewService, ParseStatusError, PrintStatus, Service, ServiceStatus,
    ServiceUpdate, StoreStats, Ticket, TicketFilter, TicketStatus, Window,
};
pub use resets::{ResetApplied, ResetMode};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Path error.
    #[error("Invalid database path: {0}")]
    InvalidPath(String),

    /// A ticket was requested for a service that does not exist.
    #[error("service not found: {0}")]
    ServiceNotFound(i64),

    /// A window operation referenced a window that does not exist.
    #[error("window not found: {0}")]
    WindowNotFound(i64),

    /// A print status update tried to move backwards or between outcomes.
    #[error("invalid print status transition for ticket {ticket_id}: {from} -> {to}")]
    InvalidPrintTransition {
        ticket_id: i64,
        from: PrintStatus,
        to: PrintStatus,
    },

    /// A queue status update is not allowed from the ticket's current status.
    #[error("invalid status transition for ticket {ticket_id}: {from} -> {to}")]
    InvalidStatusTransition {
        ticket_id: i64,
        from: TicketStatus,
        to: TicketStatus,
    },

    /// Another writer already recorded a reset for this date.
    #[error("daily reset for {0} was already recorded")]
    ResetConflict(String),

    /// A connection mutex was poisoned by a panicking holder.
    #[error("database connection lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Connection tuning for [`Store::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Number of reader connections.
    pub read_connections: usize,
    /// Busy timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            read_connections: 4,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Handle to the coordinator database.
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open or create a database at the given path.
    ///
    /// If the database doesn't exist, it will be created and migrations will be run.
    /// If it exists, any pending migrations will be applied.
    pub fn open<P: AsRef<Path>>(
        path: P,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut writer = Connection::open(path)?;
        configure_writer(&writer, options.busy_timeout)?;
        schema::run_migrations(&mut writer)?;

        let readers = (0..options.read_connections.max(1))
            .map(|_| {
                let conn = Connection::open(path)?;
                conn.busy_timeout(options.busy_timeout)?;
                conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA query_only = ON;")?;
                Ok(Mutex::new(conn))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        tracing::debug!(
            path = %path.display(),
            readers = readers.len(),
            "Opened queue database"
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            clock,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StoreResult<i32> {
        self.read(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
    }

    /// Returns true when the database answers a trivial query.
    pub fn health_check(&self) -> bool {
        self.read(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .map(|one| one == 1)
            .unwrap_or(false)
    }

    /// Row counts of the main tables.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        self.read(|conn| {
            let stats = conn.query_row(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM services),
                    (SELECT COUNT(*) FROM tickets),
                    (SELECT COUNT(*) FROM tickets WHERE status = 'pending')
                "#,
                [],
                |row| {
                    Ok(StoreStats {
                        services: row.get(0)?,
                        tickets: row.get(1)?,
                        pending_tickets: row.get(2)?,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    /// Runs `f` with exclusive access to the writer connection.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }

    /// Runs `f` on one of the reader connections.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[index]
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Current time as stored in timestamp columns.
    fn timestamp(&self) -> String {
        self.clock.now_iso()
    }
}

fn configure_writer(conn: &Connection, busy_timeout: Duration) -> StoreResult<()> {
    conn.busy_timeout(busy_timeout)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(journal_mode = %mode, "Database did not switch to WAL mode");
    }
    conn.execute_batch(
        r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA temp_store = MEMORY;
        "#,
    )?;
    Ok(())
}

/// True when `err` is a UNIQUE constraint violation.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    /// Store on a fresh temp file with a clock pinned to 2026-10-18 08:00 UTC.
    pub(crate) fn create_test_store() -> (Store, Arc<ManualClock>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clock = Arc::new(ManualClock::new(
            chrono::Utc
                .with_ymd_and_hms(2026, 10, 18, 8, 0, 0)
                .single()
                .expect("valid date"),
        ));
        let store = Store::open(
            temp_dir.path().join("queue.db"),
            StoreOptions {
                read_connections: 2,
                ..StoreOptions::default()
            },
            clock.clone(),
        )
        .expect("Failed to open store");
        (store, clock, temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::create_test_store;
    use super::*;

    #[test]
    fn test_open_runs_migrations() {
        let (store, _clock, _dir) = create_test_store();
        assert_eq!(store.schema_version().unwrap(), schema::CURRENT_SCHEMA_VERSION);
        assert!(store.health_check());
    }

    #[test]
    fn test_open_uses_wal() {
        let (store, _clock, _dir) = create_test_store();
        let mode: String = store
            .write(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_reopen_keeps_data() {
        let (store, clock, dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        let path = store.path().to_path_buf();
        drop(store);

        let reopened = Store::open(&path, StoreOptions::default(), clock).unwrap();
        assert_eq!(reopened.get_service(service.id).unwrap(), Some(service));
        drop(dir);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("queue.db");
        let store = Store::open(
            &path,
            StoreOptions::default(),
            Arc::new(crate::clock::SystemClock),
        )
        .unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_stats_empty() {
        let (store, _clock, _dir) = create_test_store();
        let stats = store.stats().unwrap();
        assert_eq!(
            stats,
            StoreStats {
                services: 0,
                tickets: 0,
                pending_tickets: 0
            }
        );
        assert_eq!(
            serde_json::to_value(stats).unwrap()["pendingTickets"],
            serde_json::json!(0)
        );
    }

    #[test]
    fn test_readers_are_query_only() {
        let (store, _clock, _dir) = create_test_store();
        let result = store.read(|conn| {
            conn.execute("DELETE FROM tickets", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }
}

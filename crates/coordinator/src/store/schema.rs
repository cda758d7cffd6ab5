//! Schema management and migrations.

use rusqlite::Connection;

use super::{StoreError, StoreResult};

/// Current schema version.
pub(crate) const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Run all pending migrations.
pub(crate) fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current_version, CURRENT_SCHEMA_VERSION
        )));
    }

    if current_version < 1 {
        migrate_v1(conn)?;
        tracing::info!(version = 1, "Applied database migration");
    }

    Ok(())
}

/// Migration to version 1: Initial schema.
fn migrate_v1(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'inactive')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS windows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            number INTEGER NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            assigned_service_id INTEGER REFERENCES services(id) ON DELETE SET NULL,
            device_id TEXT UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_number TEXT NOT NULL UNIQUE,
            service_id INTEGER NOT NULL REFERENCES services(id),
            service_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'called', 'completed', 'cancelled')),
            print_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (print_status IN ('pending', 'printing', 'printed', 'print_failed')),
            printer_id TEXT,
            created_at TEXT NOT NULL,
            called_at TEXT,
            window_label TEXT,
            position INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_tickets_service_status
        ON tickets(service_id, status);

        CREATE TABLE IF NOT EXISTS daily_resets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            last_reset_date TEXT NOT NULL UNIQUE,
            last_reset_timestamp TEXT NOT NULL,
            tickets_reset INTEGER NOT NULL DEFAULT 0,
            pdfs_reset INTEGER NOT NULL DEFAULT 0,
            cache_reset INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        "#,
    )?;

    tx.execute(&format!("PRAGMA user_version = {}", 1), [])?;

    tx.commit()?;
    Ok(())
}

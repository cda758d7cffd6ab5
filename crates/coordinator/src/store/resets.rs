//! Daily reset primitives.
//!
//! Clearing the queue is one transaction: count the tickets, delete them,
//! forget the ticket id sequence and record the reset. Either all of it
//! lands or none of it does.

use rusqlite::{params, OptionalExtension, Result as SqliteResult, Row, TransactionBehavior};

use super::{is_unique_violation, DailyResetRecord, Store, StoreError, StoreResult};

const RESET_COLUMNS: &str = "id, last_reset_date, last_reset_timestamp, tickets_reset, \
     pdfs_reset, cache_reset, created_at";

fn reset_from_row(row: &Row<'_>) -> SqliteResult<DailyResetRecord> {
    Ok(DailyResetRecord {
        id: row.get(0)?,
        last_reset_date: row.get(1)?,
        last_reset_timestamp: row.get(2)?,
        tickets_reset: row.get(3)?,
        pdfs_reset: row.get(4)?,
        cache_reset: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// How [`Store::apply_daily_reset`] treats an existing record for the date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Skip when the date already has a record.
    IfMissing,
    /// Always clear, replacing the date's record.
    Force,
}

/// What [`Store::apply_daily_reset`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetApplied {
    /// Tickets were cleared.
    Cleared { tickets_reset: i64 },
    /// The date already had a record; nothing changed.
    AlreadyRecorded,
}

impl Store {
    // =========================================================================
    // Daily Resets
    // =========================================================================

    /// Clear all tickets and record a reset for `date`.
    ///
    /// In [`ResetMode::IfMissing`] a concurrent writer that recorded the same
    /// date first surfaces as [`StoreError::ResetConflict`].
    pub fn apply_daily_reset(
        &self,
        date: &str,
        timestamp: &str,
        mode: ResetMode,
    ) -> StoreResult<ResetApplied> {
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if mode == ResetMode::IfMissing {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM daily_resets WHERE last_reset_date = ?1)",
                    params![date],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(ResetApplied::AlreadyRecorded);
                }
            }

            let tickets_reset: i64 =
                tx.query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;
            tx.execute("DELETE FROM tickets", [])?;
            tx.execute("DELETE FROM sqlite_sequence WHERE name = 'tickets'", [])?;

            let recorded = match mode {
                ResetMode::IfMissing => tx.execute(
                    r#"
                    INSERT INTO daily_resets
                        (last_reset_date, last_reset_timestamp, tickets_reset,
                         pdfs_reset, cache_reset, created_at)
                    VALUES (?1, ?2, ?3, 0, 0, ?2)
                    "#,
                    params![date, timestamp, tickets_reset],
                ),
                ResetMode::Force => tx.execute(
                    r#"
                    INSERT INTO daily_resets
                        (last_reset_date, last_reset_timestamp, tickets_reset,
                         pdfs_reset, cache_reset, created_at)
                    VALUES (?1, ?2, ?3, 0, 0, ?2)
                    ON CONFLICT(last_reset_date) DO UPDATE SET
                        last_reset_timestamp = excluded.last_reset_timestamp,
                        tickets_reset = excluded.tickets_reset
                    "#,
                    params![date, timestamp, tickets_reset],
                ),
            };

            match recorded {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::ResetConflict(date.to_string()));
                }
                Err(e) => return Err(e.into()),
            }

            tx.commit()?;
            Ok(ResetApplied::Cleared { tickets_reset })
        })
    }

    /// The reset recorded for `date`, if any.
    pub fn reset_for_date(&self, date: &str) -> StoreResult<Option<DailyResetRecord>> {
        self.read(|conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {RESET_COLUMNS} FROM daily_resets WHERE last_reset_date = ?1"),
                    params![date],
                    reset_from_row,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// The most recent reset.
    pub fn last_reset(&self) -> StoreResult<Option<DailyResetRecord>> {
        Ok(self.reset_history(1)?.into_iter().next())
    }

    /// Resets ordered by date, most recent first.
    pub fn reset_history(&self, limit: u32) -> StoreResult<Vec<DailyResetRecord>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESET_COLUMNS} FROM daily_resets ORDER BY last_reset_date DESC LIMIT ?1"
            ))?;
            let records = stmt
                .query_map(params![limit], reset_from_row)?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_test_store;
    use super::super::*;

    #[test]
    fn test_apply_if_missing_clears_once() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        store.create_ticket(service.id, None).unwrap();
        store.create_ticket(service.id, None).unwrap();

        let first = store
            .apply_daily_reset("2026-10-18", "2026-10-18T08:00:00.000Z", ResetMode::IfMissing)
            .unwrap();
        assert_eq!(first, ResetApplied::Cleared { tickets_reset: 2 });

        store.create_ticket(service.id, None).unwrap();
        let second = store
            .apply_daily_reset("2026-10-18", "2026-10-18T09:00:00.000Z", ResetMode::IfMissing)
            .unwrap();
        assert_eq!(second, ResetApplied::AlreadyRecorded);
        assert_eq!(store.stats().unwrap().tickets, 1);
    }

    #[test]
    fn test_apply_resets_sequence() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        for _ in 0..3 {
            store.create_ticket(service.id, None).unwrap();
        }

        store
            .apply_daily_reset("2026-10-18", "t", ResetMode::IfMissing)
            .unwrap();
        assert_eq!(store.create_ticket(service.id, None).unwrap().id, 1);
    }

    #[test]
    fn test_force_replaces_record() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        store
            .apply_daily_reset("2026-10-18", "t1", ResetMode::IfMissing)
            .unwrap();

        for _ in 0..4 {
            store.create_ticket(service.id, None).unwrap();
        }
        let forced = store
            .apply_daily_reset("2026-10-18", "t2", ResetMode::Force)
            .unwrap();
        assert_eq!(forced, ResetApplied::Cleared { tickets_reset: 4 });

        let history = store.reset_history(30).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tickets_reset, 4);
        assert_eq!(history[0].last_reset_timestamp, "t2");
    }

    #[test]
    fn test_history_most_recent_first() {
        let (store, _clock, _dir) = create_test_store();
        for date in ["2026-10-16", "2026-10-18", "2026-10-17"] {
            store
                .apply_daily_reset(date, "t", ResetMode::IfMissing)
                .unwrap();
        }

        let dates: Vec<_> = store
            .reset_history(2)
            .unwrap()
            .into_iter()
            .map(|r| r.last_reset_date)
            .collect();
        assert_eq!(dates, vec!["2026-10-18", "2026-10-17"]);
        assert_eq!(
            store.last_reset().unwrap().unwrap().last_reset_date,
            "2026-10-18"
        );
        assert!(store.reset_for_date("2026-10-15").unwrap().is_none());
    }

    #[test]
    fn test_failed_insert_rolls_back() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        store.create_ticket(service.id, None).unwrap();
        store
            .write(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TRIGGER fail_reset BEFORE INSERT ON daily_resets
                    BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;
                    "#,
                )?;
                Ok(())
            })
            .unwrap();

        let result = store.apply_daily_reset("2026-10-18", "t", ResetMode::IfMissing);
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(store.stats().unwrap().tickets, 1);
        assert!(store.reset_for_date("2026-10-18").unwrap().is_none());
    }
}

//! Window records.
//!
//! A window is bound to at most one physical device. Registration is keyed by
//! device id and is idempotent, so a window station reconnecting after a
//! restart gets its old window back. Windows are deactivated, never deleted.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use super::services::find_service;
use super::{Store, StoreError, StoreResult, Window};

const WINDOW_COLUMNS: &str = "id, number, active, assigned_service_id, device_id";

fn window_from_row(row: &Row<'_>) -> SqliteResult<Window> {
    Ok(Window {
        id: row.get(0)?,
        number: row.get(1)?,
        active: row.get(2)?,
        assigned_service_id: row.get(3)?,
        device_id: row.get(4)?,
    })
}

fn find_window(conn: &Connection, id: i64) -> StoreResult<Option<Window>> {
    let window = conn
        .query_row(
            &format!("SELECT {WINDOW_COLUMNS} FROM windows WHERE id = ?1"),
            params![id],
            window_from_row,
        )
        .optional()?;
    Ok(window)
}

fn find_window_by_device(conn: &Connection, device_id: &str) -> StoreResult<Option<Window>> {
    let window = conn
        .query_row(
            &format!("SELECT {WINDOW_COLUMNS} FROM windows WHERE device_id = ?1"),
            params![device_id],
            window_from_row,
        )
        .optional()?;
    Ok(window)
}

fn ensure_service(conn: &Connection, service_id: Option<i64>) -> StoreResult<()> {
    if let Some(id) = service_id {
        if find_service(conn, id)?.is_none() {
            return Err(StoreError::ServiceNotFound(id));
        }
    }
    Ok(())
}

fn insert_window(
    conn: &Connection,
    device_id: Option<&str>,
    service_id: Option<i64>,
    now: &str,
) -> StoreResult<Window> {
    conn.execute(
        r#"
        INSERT INTO windows (number, active, assigned_service_id, device_id, created_at, updated_at)
        VALUES ((SELECT COALESCE(MAX(number), 0) + 1 FROM windows), 1, ?1, ?2, ?3, ?3)
        "#,
        params![service_id, device_id, now],
    )?;
    let id = conn.last_insert_rowid();
    find_window(conn, id)?.ok_or(StoreError::WindowNotFound(id))
}

impl Store {
    // =========================================================================
    // Windows
    // =========================================================================

    /// Create an unbound window with the next free number.
    pub fn create_window(&self, service_id: Option<i64>) -> StoreResult<Window> {
        let now = self.timestamp();
        self.write(|conn| {
            let tx = conn.transaction()?;
            ensure_service(&tx, service_id)?;
            let window = insert_window(&tx, None, service_id, &now)?;
            tx.commit()?;
            tracing::info!(window_id = window.id, number = window.number, "Created window");
            Ok(window)
        })
    }

    /// Return the window bound to `device_id`, creating it on first registration.
    ///
    /// An existing window is reactivated. When `service_id` is given it
    /// replaces the current assignment.
    pub fn register_window_for_device(
        &self,
        device_id: &str,
        service_id: Option<i64>,
    ) -> StoreResult<Window> {
        let now = self.timestamp();
        self.write(|conn| {
            let tx = conn.transaction()?;
            ensure_service(&tx, service_id)?;

            let window = match find_window_by_device(&tx, device_id)? {
                Some(existing) => {
                    tx.execute(
                        r#"
                        UPDATE windows
                        SET active = 1,
                            assigned_service_id = COALESCE(?1, assigned_service_id),
                            updated_at = ?2
                        WHERE id = ?3
                        "#,
                        params![service_id, now, existing.id],
                    )?;
                    find_window(&tx, existing.id)?.ok_or(StoreError::WindowNotFound(existing.id))?
                }
                None => insert_window(&tx, Some(device_id), service_id, &now)?,
            };

            tx.commit()?;
            tracing::info!(
                device_id = %device_id,
                window_id = window.id,
                number = window.number,
                "Registered window for device"
            );
            Ok(window)
        })
    }

    /// Get a window by id.
    pub fn get_window(&self, id: i64) -> StoreResult<Option<Window>> {
        self.read(|conn| find_window(conn, id))
    }

    /// Get the window bound to a device.
    pub fn get_window_by_device(&self, device_id: &str) -> StoreResult<Option<Window>> {
        self.read(|conn| find_window_by_device(conn, device_id))
    }

    /// All windows ordered by number.
    pub fn list_windows(&self) -> StoreResult<Vec<Window>> {
        self.query_windows(&format!(
            "SELECT {WINDOW_COLUMNS} FROM windows ORDER BY number"
        ))
    }

    /// Active windows ordered by number.
    pub fn active_windows(&self) -> StoreResult<Vec<Window>> {
        self.query_windows(&format!(
            "SELECT {WINDOW_COLUMNS} FROM windows WHERE active = 1 ORDER BY number"
        ))
    }

    fn query_windows(&self, sql: &str) -> StoreResult<Vec<Window>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let windows = stmt
                .query_map([], window_from_row)?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(windows)
        })
    }

    /// Assign a service to a window, or clear the assignment with `None`.
    pub fn assign_window_service(
        &self,
        window_id: i64,
        service_id: Option<i64>,
    ) -> StoreResult<Window> {
        let now = self.timestamp();
        self.write(|conn| {
            let tx = conn.transaction()?;
            ensure_service(&tx, service_id)?;
            let rows_affected = tx.execute(
                "UPDATE windows SET assigned_service_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![service_id, now, window_id],
            )?;
            if rows_affected == 0 {
                return Err(StoreError::WindowNotFound(window_id));
            }
            let window = find_window(&tx, window_id)?.ok_or(StoreError::WindowNotFound(window_id))?;
            tx.commit()?;
            Ok(window)
        })
    }

    /// Activate or deactivate a window.
    pub fn set_window_active(&self, window_id: i64, active: bool) -> StoreResult<bool> {
        let now = self.timestamp();
        self.write(|conn| {
            let rows_affected = conn.execute(
                "UPDATE windows SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, now, window_id],
            )?;
            Ok(rows_affected > 0)
        })
    }

    /// Deactivate the window bound to a device, returning it if one exists.
    pub fn deactivate_window_for_device(&self, device_id: &str) -> StoreResult<Option<Window>> {
        let now = self.timestamp();
        self.write(|conn| {
            conn.execute(
                "UPDATE windows SET active = 0, updated_at = ?1 WHERE device_id = ?2",
                params![now, device_id],
            )?;
            find_window_by_device(conn, device_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_test_store;
    use super::super::*;

    #[test]
    fn test_register_is_idempotent() {
        let (store, _clock, _dir) = create_test_store();

        let first = store.register_window_for_device("win-a", None).unwrap();
        let again = store.register_window_for_device("win-a", None).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.number, 1);
        assert!(first.active);

        let second = store.register_window_for_device("win-b", None).unwrap();
        assert_eq!(second.number, 2);
        assert_eq!(store.list_windows().unwrap().len(), 2);
    }

    #[test]
    fn test_register_reactivates_and_assigns() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();

        let window = store.register_window_for_device("win-a", None).unwrap();
        let deactivated = store.deactivate_window_for_device("win-a").unwrap().unwrap();
        assert!(!deactivated.active);
        assert!(store.active_windows().unwrap().is_empty());

        let back = store
            .register_window_for_device("win-a", Some(service.id))
            .unwrap();
        assert_eq!(back.id, window.id);
        assert!(back.active);
        assert_eq!(back.assigned_service_id, Some(service.id));

        // Re-registering without a service keeps the assignment.
        let kept = store.register_window_for_device("win-a", None).unwrap();
        assert_eq!(kept.assigned_service_id, Some(service.id));
    }

    #[test]
    fn test_register_unknown_service_rejected() {
        let (store, _clock, _dir) = create_test_store();
        assert!(matches!(
            store.register_window_for_device("win-a", Some(9)),
            Err(StoreError::ServiceNotFound(9))
        ));
        assert!(store.get_window_by_device("win-a").unwrap().is_none());
    }

    #[test]
    fn test_assign_and_clear_service() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        let window = store.create_window(None).unwrap();
        assert_eq!(window.device_id, None);

        let assigned = store
            .assign_window_service(window.id, Some(service.id))
            .unwrap();
        assert_eq!(assigned.assigned_service_id, Some(service.id));

        let cleared = store.assign_window_service(window.id, None).unwrap();
        assert_eq!(cleared.assigned_service_id, None);

        assert!(matches!(
            store.assign_window_service(77, None),
            Err(StoreError::WindowNotFound(77))
        ));
    }

    #[test]
    fn test_set_window_active() {
        let (store, _clock, _dir) = create_test_store();
        let window = store.create_window(None).unwrap();

        assert!(store.set_window_active(window.id, false).unwrap());
        assert!(!store.get_window(window.id).unwrap().unwrap().active);
        assert!(!store.set_window_active(500, true).unwrap());
        assert!(store.deactivate_window_for_device("ghost").unwrap().is_none());
    }
}

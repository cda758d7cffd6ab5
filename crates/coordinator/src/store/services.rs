//! Service records.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use super::{NewService, Service, ServiceStatus, ServiceUpdate, Store, StoreResult};

const SERVICE_COLUMNS: &str = "id, name, description, status";

fn service_from_row(row: &Row<'_>) -> SqliteResult<Service> {
    Ok(Service {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
    })
}

/// Looks a service up on an arbitrary connection (used inside write transactions).
pub(super) fn find_service(conn: &Connection, id: i64) -> StoreResult<Option<Service>> {
    let service = conn
        .query_row(
            &format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?1"),
            params![id],
            service_from_row,
        )
        .optional()?;
    Ok(service)
}

impl Store {
    // =========================================================================
    // Services
    // =========================================================================

    /// Create a service and return it with its assigned id.
    pub fn create_service(&self, new: &NewService) -> StoreResult<Service> {
        let now = self.timestamp();
        self.write(|conn| {
            conn.execute(
                r#"
                INSERT INTO services (name, description, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                "#,
                params![new.name, new.description, new.status, now],
            )?;
            let id = conn.last_insert_rowid();
            tracing::info!(service_id = id, name = %new.name, "Created service");
            Ok(Service {
                id,
                name: new.name.clone(),
                description: new.description.clone(),
                status: new.status,
            })
        })
    }

    /// Get a service by id.
    pub fn get_service(&self, id: i64) -> StoreResult<Option<Service>> {
        self.read(|conn| find_service(conn, id))
    }

    /// List all services ordered by id.
    pub fn list_services(&self) -> StoreResult<Vec<Service>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SERVICE_COLUMNS} FROM services ORDER BY id"))?;
            let services = stmt
                .query_map([], service_from_row)?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(services)
        })
    }

    /// Active services ordered by name.
    pub fn active_services(&self) -> StoreResult<Vec<Service>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVICE_COLUMNS} FROM services WHERE status = 'active' ORDER BY name"
            ))?;
            let services = stmt
                .query_map([], service_from_row)?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(services)
        })
    }

    /// Apply a partial update. Returns the updated service, or `None` if it doesn't exist.
    pub fn update_service(&self, id: i64, update: &ServiceUpdate) -> StoreResult<Option<Service>> {
        let now = self.timestamp();
        self.write(|conn| {
            let rows_affected = conn.execute(
                r#"
                UPDATE services
                SET name = COALESCE(?1, name),
                    description = COALESCE(?2, description),
                    status = COALESCE(?3, status),
                    updated_at = ?4
                WHERE id = ?5
                "#,
                params![update.name, update.description, update.status, now, id],
            )?;
            if rows_affected == 0 {
                return Ok(None);
            }
            find_service(conn, id)
        })
    }

    /// Activate or deactivate a service.
    pub fn set_service_status(&self, id: i64, status: ServiceStatus) -> StoreResult<bool> {
        let now = self.timestamp();
        self.write(|conn| {
            let rows_affected = conn.execute(
                "UPDATE services SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, now, id],
            )?;
            Ok(rows_affected > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_test_store;
    use super::super::*;

    #[test]
    fn test_create_and_get_service() {
        let (store, _clock, _dir) = create_test_store();

        let service = store.create_service(&NewService::active("Visa")).unwrap();
        assert_eq!(service.id, 1);
        assert_eq!(service.status, ServiceStatus::Active);

        assert_eq!(store.get_service(1).unwrap(), Some(service));
        assert_eq!(store.get_service(99).unwrap(), None);
    }

    #[test]
    fn test_active_services_ordered_by_name() {
        let (store, _clock, _dir) = create_test_store();
        store.create_service(&NewService::active("Passports")).unwrap();
        store.create_service(&NewService::active("Customs")).unwrap();
        store
            .create_service(&NewService {
                name: "Archive".to_string(),
                description: Some("closed".to_string()),
                status: ServiceStatus::Inactive,
            })
            .unwrap();

        let names: Vec<_> = store
            .active_services()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Customs", "Passports"]);
        assert_eq!(store.list_services().unwrap().len(), 3);
    }

    #[test]
    fn test_update_service() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();

        let updated = store
            .update_service(
                service.id,
                &ServiceUpdate {
                    description: Some("Short stay".to_string()),
                    ..ServiceUpdate::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Visa");
        assert_eq!(updated.description.as_deref(), Some("Short stay"));

        assert_eq!(
            store.update_service(42, &ServiceUpdate::default()).unwrap(),
            None
        );
    }

    #[test]
    fn test_set_service_status() {
        let (store, _clock, _dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();

        assert!(store
            .set_service_status(service.id, ServiceStatus::Inactive)
            .unwrap());
        assert!(store.active_services().unwrap().is_empty());
        assert!(!store.set_service_status(7, ServiceStatus::Active).unwrap());
    }
}

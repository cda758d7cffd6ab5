//! Ticket records.
//!
//! Ticket ids are assigned inside an IMMEDIATE transaction on the writer
//! connection, as one past the larger of the highest live id and the table's
//! AUTOINCREMENT sequence. Ids therefore never repeat within a reset epoch and
//! only restart at 1 after the daily reset clears the sequence.

use rusqlite::{
    params, params_from_iter, types::Value, Connection, OptionalExtension, Result as SqliteResult,
    Row, TransactionBehavior,
};

use super::services::find_service;
use super::{PrintStatus, Store, StoreError, StoreResult, Ticket, TicketFilter, TicketStatus};

const TICKET_COLUMNS: &str = "id, ticket_number, service_id, service_name, status, print_status, \
     printer_id, created_at, called_at, window_label, position";

fn ticket_from_row(row: &Row<'_>) -> SqliteResult<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        ticket_number: row.get(1)?,
        service_id: row.get(2)?,
        service_name: row.get(3)?,
        status: row.get(4)?,
        print_status: row.get(5)?,
        printer_id: row.get(6)?,
        created_at: row.get(7)?,
        called_at: row.get(8)?,
        window_label: row.get(9)?,
        position: row.get(10)?,
    })
}

fn find_ticket(conn: &Connection, id: i64) -> StoreResult<Option<Ticket>> {
    let ticket = conn
        .query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            params![id],
            ticket_from_row,
        )
        .optional()?;
    Ok(ticket)
}

impl Store {
    // =========================================================================
    // Tickets
    // =========================================================================

    /// Create a pending ticket for a service.
    ///
    /// Fails with [`StoreError::ServiceNotFound`] if the service doesn't exist.
    pub fn create_ticket(&self, service_id: i64, printer_id: Option<&str>) -> StoreResult<Ticket> {
        let now = self.timestamp();
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let service =
                find_service(&tx, service_id)?.ok_or(StoreError::ServiceNotFound(service_id))?;

            let id: i64 = tx.query_row(
                r#"
                SELECT MAX(
                    COALESCE((SELECT MAX(id) FROM tickets), 0),
                    COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'tickets'), 0)
                ) + 1
                "#,
                [],
                |row| row.get(0),
            )?;

            let ahead: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tickets WHERE service_id = ?1 AND status = 'pending'",
                params![service_id],
                |row| row.get(0),
            )?;

            let ticket = Ticket {
                id,
                ticket_number: id.to_string(),
                service_id,
                service_name: service.name,
                status: TicketStatus::Pending,
                print_status: PrintStatus::Pending,
                printer_id: printer_id.map(str::to_string),
                created_at: now.clone(),
                called_at: None,
                window_label: None,
                position: Some(ahead + 1),
            };

            tx.execute(
                r#"
                INSERT INTO tickets (id, ticket_number, service_id, service_name, status,
                                     print_status, printer_id, created_at, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    ticket.id,
                    ticket.ticket_number,
                    ticket.service_id,
                    ticket.service_name,
                    ticket.status,
                    ticket.print_status,
                    ticket.printer_id,
                    ticket.created_at,
                    ticket.position
                ],
            )?;
            tx.commit()?;

            tracing::info!(
                ticket_id = ticket.id,
                service_id = ticket.service_id,
                position = ahead + 1,
                "Created ticket"
            );
            Ok(ticket)
        })
    }

    /// Get a ticket by id.
    pub fn get_ticket(&self, id: i64) -> StoreResult<Option<Ticket>> {
        self.read(|conn| find_ticket(conn, id))
    }

    /// List tickets in creation order, optionally filtered.
    pub fn list_tickets(&self, filter: TicketFilter) -> StoreResult<Vec<Ticket>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(service_id) = filter.service_id {
            values.push(Value::Integer(service_id));
            clauses.push(format!("service_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {TICKET_COLUMNS} FROM tickets");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");

        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let tickets = stmt
                .query_map(params_from_iter(values), ticket_from_row)?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(tickets)
        })
    }

    /// Move a ticket's print status forward.
    ///
    /// Returns `Ok(false)` if the ticket doesn't exist and `Ok(true)` if the
    /// status was applied or already current. Backward moves, and moves from
    /// one outcome to the other, fail with [`StoreError::InvalidPrintTransition`].
    pub fn update_ticket_print_status(&self, id: i64, status: PrintStatus) -> StoreResult<bool> {
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<PrintStatus> = tx
                .query_row(
                    "SELECT print_status FROM tickets WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(false);
            };
            if current == status {
                return Ok(true);
            }
            if !current.can_advance_to(status) {
                return Err(StoreError::InvalidPrintTransition {
                    ticket_id: id,
                    from: current,
                    to: status,
                });
            }

            tx.execute(
                "UPDATE tickets SET print_status = ?1 WHERE id = ?2",
                params![status, id],
            )?;
            tx.commit()?;

            tracing::debug!(ticket_id = id, from = %current, to = %status, "Updated print status");
            Ok(true)
        })
    }

    /// Call a pending ticket to a window.
    pub fn call_ticket(&self, id: i64, window_label: Option<&str>) -> StoreResult<Option<Ticket>> {
        let now = self.timestamp();
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(ticket) = find_ticket(&tx, id)? else {
                return Ok(None);
            };
            check_transition(&ticket, TicketStatus::Called)?;

            tx.execute(
                r#"
                UPDATE tickets
                SET status = 'called', called_at = ?1, window_label = ?2
                WHERE id = ?3
                "#,
                params![now, window_label, id],
            )?;
            let called = find_ticket(&tx, id)?;
            tx.commit()?;
            Ok(called)
        })
    }

    /// Call the oldest pending ticket of a service. `None` when the queue is empty.
    pub fn call_next_ticket(
        &self,
        service_id: i64,
        window_label: Option<&str>,
    ) -> StoreResult<Option<Ticket>> {
        let now = self.timestamp();
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let next: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT id FROM tickets
                    WHERE service_id = ?1 AND status = 'pending'
                    ORDER BY id
                    LIMIT 1
                    "#,
                    params![service_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = next else {
                return Ok(None);
            };

            tx.execute(
                r#"
                UPDATE tickets
                SET status = 'called', called_at = ?1, window_label = ?2
                WHERE id = ?3
                "#,
                params![now, window_label, id],
            )?;
            let called = find_ticket(&tx, id)?;
            tx.commit()?;

            tracing::info!(ticket_id = id, service_id, window = ?window_label, "Called ticket");
            Ok(called)
        })
    }

    /// Mark a called ticket as served.
    pub fn complete_ticket(&self, id: i64) -> StoreResult<Option<Ticket>> {
        self.set_ticket_status(id, TicketStatus::Completed)
    }

    /// Cancel a pending or called ticket.
    pub fn cancel_ticket(&self, id: i64) -> StoreResult<Option<Ticket>> {
        self.set_ticket_status(id, TicketStatus::Cancelled)
    }

    fn set_ticket_status(&self, id: i64, status: TicketStatus) -> StoreResult<Option<Ticket>> {
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(ticket) = find_ticket(&tx, id)? else {
                return Ok(None);
            };
            check_transition(&ticket, status)?;

            tx.execute(
                "UPDATE tickets SET status = ?1 WHERE id = ?2",
                params![status, id],
            )?;
            let updated = find_ticket(&tx, id)?;
            tx.commit()?;
            Ok(updated)
        })
    }

    /// Administrative removal of a single ticket.
    pub fn delete_ticket(&self, id: i64) -> StoreResult<bool> {
        self.write(|conn| {
            let rows_affected = conn.execute("DELETE FROM tickets WHERE id = ?1", params![id])?;
            if rows_affected > 0 {
                tracing::warn!(ticket_id = id, "Ticket deleted by administrator");
            }
            Ok(rows_affected > 0)
        })
    }
}

fn check_transition(ticket: &Ticket, next: TicketStatus) -> StoreResult<()> {
    if ticket.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidStatusTransition {
            ticket_id: ticket.id,
            from: ticket.status,
            to: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_test_store;
    use super::super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store_with_service() -> (Store, i64, tempfile::TempDir) {
        let (store, _clock, dir) = create_test_store();
        let service = store.create_service(&NewService::active("Visa")).unwrap();
        (store, service.id, dir)
    }

    #[test]
    fn test_create_ticket() {
        let (store, service_id, _dir) = store_with_service();

        let ticket = store.create_ticket(service_id, Some("P1")).unwrap();
        assert_eq!(ticket.id, 1);
        assert_eq!(ticket.ticket_number, "1");
        assert_eq!(ticket.service_name, "Visa");
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.print_status, PrintStatus::Pending);
        assert_eq!(ticket.printer_id.as_deref(), Some("P1"));
        assert_eq!(ticket.created_at, "2026-10-18T08:00:00.000Z");
        assert_eq!(ticket.position, Some(1));

        assert_eq!(store.get_ticket(1).unwrap(), Some(ticket));
        assert_eq!(store.get_ticket(2).unwrap(), None);
    }

    #[test]
    fn test_create_ticket_unknown_service() {
        let (store, _clock, _dir) = create_test_store();
        assert!(matches!(
            store.create_ticket(5, None),
            Err(StoreError::ServiceNotFound(5))
        ));
        assert_eq!(store.stats().unwrap().tickets, 0);
    }

    #[test]
    fn test_ticket_ids_not_reused_after_delete() {
        let (store, service_id, _dir) = store_with_service();
        store.create_ticket(service_id, None).unwrap();
        let second = store.create_ticket(service_id, None).unwrap();

        assert!(store.delete_ticket(second.id).unwrap());
        let third = store.create_ticket(service_id, None).unwrap();
        assert_eq!(third.id, 3);
        assert!(!store.delete_ticket(99).unwrap());
    }

    #[test]
    fn test_position_counts_pending_per_service() {
        let (store, visa, _dir) = store_with_service();
        let customs = store.create_service(&NewService::active("Customs")).unwrap().id;

        store.create_ticket(visa, None).unwrap();
        store.create_ticket(customs, None).unwrap();
        let third = store.create_ticket(visa, None).unwrap();
        assert_eq!(third.position, Some(2));
    }

    #[test]
    fn test_concurrent_creation_is_gapless() {
        let (store, service_id, _dir) = store_with_service();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| store.create_ticket(service_id, None).unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();

        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 200);
        assert_eq!(ids, (1..=200).collect::<Vec<i64>>());
    }

    #[test]
    fn test_print_status_forward_only() {
        let (store, service_id, _dir) = store_with_service();
        let ticket = store.create_ticket(service_id, None).unwrap();

        assert!(store
            .update_ticket_print_status(ticket.id, PrintStatus::Printing)
            .unwrap());
        assert!(store
            .update_ticket_print_status(ticket.id, PrintStatus::Printed)
            .unwrap());

        // Same state is a successful no-op.
        assert!(store
            .update_ticket_print_status(ticket.id, PrintStatus::Printed)
            .unwrap());

        let err = store
            .update_ticket_print_status(ticket.id, PrintStatus::Pending)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidPrintTransition {
                from: PrintStatus::Printed,
                to: PrintStatus::Pending,
                ..
            }
        ));
        assert!(store
            .update_ticket_print_status(ticket.id, PrintStatus::PrintFailed)
            .is_err());

        assert_eq!(
            store.get_ticket(ticket.id).unwrap().unwrap().print_status,
            PrintStatus::Printed
        );
    }

    #[test]
    fn test_print_status_pending_straight_to_printed() {
        let (store, service_id, _dir) = store_with_service();
        let ticket = store.create_ticket(service_id, None).unwrap();
        assert!(store
            .update_ticket_print_status(ticket.id, PrintStatus::Printed)
            .unwrap());
    }

    #[test]
    fn test_print_status_missing_ticket() {
        let (store, _service_id, _dir) = store_with_service();
        assert!(!store
            .update_ticket_print_status(404, PrintStatus::Printed)
            .unwrap());
    }

    #[test]
    fn test_call_complete_cancel() {
        let (store, service_id, _dir) = store_with_service();
        let first = store.create_ticket(service_id, None).unwrap();
        let second = store.create_ticket(service_id, None).unwrap();

        let called = store
            .call_next_ticket(service_id, Some("3"))
            .unwrap()
            .unwrap();
        assert_eq!(called.id, first.id);
        assert_eq!(called.status, TicketStatus::Called);
        assert_eq!(called.window_label.as_deref(), Some("3"));
        assert!(called.called_at.is_some());
        assert_eq!(called.snapshot().window_number, Some(3));

        let completed = store.complete_ticket(first.id).unwrap().unwrap();
        assert_eq!(completed.status, TicketStatus::Completed);
        assert!(matches!(
            store.cancel_ticket(first.id),
            Err(StoreError::InvalidStatusTransition { .. })
        ));

        assert!(matches!(
            store.complete_ticket(second.id),
            Err(StoreError::InvalidStatusTransition { .. })
        ));
        let cancelled = store.cancel_ticket(second.id).unwrap().unwrap();
        assert_eq!(cancelled.status, TicketStatus::Cancelled);

        assert!(store.call_next_ticket(service_id, None).unwrap().is_none());
        assert!(store.call_ticket(999, None).unwrap().is_none());
    }

    #[test]
    fn test_list_tickets_filters() {
        let (store, visa, _dir) = store_with_service();
        let customs = store.create_service(&NewService::active("Customs")).unwrap().id;
        store.create_ticket(visa, None).unwrap();
        let t2 = store.create_ticket(customs, None).unwrap();
        store.create_ticket(visa, None).unwrap();
        store.call_ticket(t2.id, Some("1")).unwrap();

        assert_eq!(store.list_tickets(TicketFilter::default()).unwrap().len(), 3);
        assert_eq!(
            store
                .list_tickets(TicketFilter {
                    service_id: Some(visa),
                    status: None
                })
                .unwrap()
                .len(),
            2
        );
        let called = store
            .list_tickets(TicketFilter {
                service_id: Some(customs),
                status: Some(TicketStatus::Called),
            })
            .unwrap();
        assert_eq!(called.len(), 1);
        assert_eq!(called[0].id, t2.id);

        let stats = store.stats().unwrap();
        assert_eq!(stats.tickets, 3);
        assert_eq!(stats.pending_tickets, 2);
        assert_eq!(stats.services, 2);
    }
}

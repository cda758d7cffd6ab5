//! Event router for dispatching inbound station events.
//!
//! [`EventRouter::route`] maps one inbound [`Envelope`] to the component that
//! handles it and returns the reply meant for the sending connection, if any.
//! Events for other stations are emitted through the hub by the handlers.
//! [`EventRouter::handle`] wraps `route` and delivers the reply, or the
//! event-specific error reply, to the sender.

use std::sync::Arc;

use protocol::events;
use protocol::{
    CallNextTicket, CancelRequest, CreateTicket, DeviceRegistration, Envelope, HistoryQuery,
    ProtocolError, RemotePrintRequest, RemotePrintResponse, StationKind, UpdatePrintStatus,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, PrintJobBroker};
use crate::hub::{HubError, RealtimeHub};
use crate::reset::{DailyResetEngine, ManualResetReport, ResetError};
use crate::store::{PrintStatus, Store, StoreError, Ticket};

/// Result type for router operations: an optional reply to the sender.
pub type RouterResult = Result<Option<Envelope>, RouterError>;

/// Errors that can occur during event routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The payload did not match the event.
    #[error("invalid payload: {0}")]
    Payload(#[from] ProtocolError),

    /// Persistence error.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Daily reset error.
    #[error("{0}")]
    Reset(#[from] ResetError),

    /// Print request refused.
    #[error("{0}")]
    Broker(#[from] BrokerError),

    /// Realtime hub error.
    #[error("{0}")]
    Hub(#[from] HubError),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler for this event.
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl RouterError {
    /// The reply a station receives when handling `request` failed.
    pub fn to_reply(&self, request: &Envelope) -> Envelope {
        let message = self.to_string();
        match request.event.as_str() {
            events::PRINT_REMOTE_REQUEST => Envelope::new(
                events::PRINT_REQUEST_FAILED,
                json!({
                    "requestId": request.data.get("id").and_then(Value::as_str).unwrap_or_default(),
                    "error": message,
                }),
            ),
            events::TICKET_CREATE
            | events::TICKET_UPDATE_PRINT_STATUS
            | events::TICKET_CALL_NEXT => Envelope::new(
                events::TICKET_ERROR,
                json!({ "event": request.event, "message": message }),
            ),
            events::RESET_FORCE => Envelope::new(
                events::RESET_RESULT,
                json!({ "success": false, "ticketsCleared": 0, "message": message }),
            ),
            _ => Envelope::new(
                events::ERROR,
                json!({ "event": request.event, "message": message }),
            ),
        }
    }
}

/// Dispatches station events to the store, reset engine, broker and hub.
pub struct EventRouter {
    store: Arc<Store>,
    reset: Arc<DailyResetEngine>,
    hub: Arc<RealtimeHub>,
    broker: Arc<PrintJobBroker>,
}

impl EventRouter {
    pub fn new(
        store: Arc<Store>,
        reset: Arc<DailyResetEngine>,
        hub: Arc<RealtimeHub>,
        broker: Arc<PrintJobBroker>,
    ) -> Self {
        Self {
            store,
            reset,
            hub,
            broker,
        }
    }

    /// Route an event and deliver the reply (or error reply) to the sender.
    pub fn handle(&self, connection_id: &str, envelope: Envelope) {
        let reply = match self.route(connection_id, &envelope) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    event = %envelope.event,
                    error = %e,
                    "Event handling failed"
                );
                Some(e.to_reply(&envelope))
            }
        };

        if let Some(reply) = reply {
            self.hub
                .emit_to_connection(connection_id, &reply.event, reply.data);
        }
    }

    /// Route an inbound event.
    ///
    /// Returns `Ok(Some(reply))` if a reply should be sent back to the sender,
    /// `Ok(None)` if none is needed, or `Err(error)` if handling failed.
    pub fn route(&self, connection_id: &str, envelope: &Envelope) -> RouterResult {
        debug!(connection_id = %connection_id, event = %envelope.event, "Routing event");

        match envelope.event.as_str() {
            // Devices
            events::DEVICE_REGISTER => self.handle_device_register(connection_id, envelope.payload()?),

            // Print lifecycle
            events::PRINT_REMOTE_REQUEST => self.handle_print_request(envelope.payload()?),
            events::PRINT_REMOTE_RESULT => self.handle_print_result(envelope.payload()?),
            events::PRINT_GET_PENDING => Ok(Some(reply(
                events::PRINT_PENDING_LIST,
                &self.broker.list_pending(),
            ))),
            events::PRINT_CANCEL_REQUEST => self.handle_print_cancel(envelope.payload()?),
            events::PRINT_EXECUTE_REMOTE => {
                // Only the coordinator fans jobs out.
                debug!(connection_id = %connection_id, "Ignoring execute-remote from station");
                Ok(None)
            }

            // Tickets and services
            events::TICKET_CREATE => self.handle_ticket_create(envelope.payload()?),
            events::TICKET_UPDATE_PRINT_STATUS => {
                self.handle_update_print_status(envelope.payload()?)
            }
            events::TICKET_CALL_NEXT => self.handle_call_next(envelope.payload()?),
            events::SERVICES_GET_ACTIVE => self.handle_active_services(),

            // Daily reset and diagnostics
            events::RESET_GET_STATUS => {
                Ok(Some(reply(events::RESET_STATUS, &self.reset.status()?)))
            }
            events::RESET_GET_HISTORY => {
                let query = if envelope.data.is_null() {
                    HistoryQuery::default()
                } else {
                    envelope.payload()?
                };
                self.handle_reset_history(query)
            }
            events::RESET_FORCE => self.handle_reset_force(connection_id),
            events::SYSTEM_GET_STATS => self.handle_system_stats(),

            other => Err(RouterError::UnknownEvent(other.to_string())),
        }
    }

    /// Clean up after a connection closed.
    ///
    /// Announces the device's departure and deactivates a window station's
    /// window.
    pub fn on_disconnect(&self, connection_id: &str) {
        let Some(station) = self.hub.disconnect(connection_id) else {
            return;
        };
        let Some(device) = station.device else {
            return;
        };

        self.hub.emit_to_all(
            events::DEVICE_DISCONNECTED,
            json!({
                "deviceId": device.device_id,
                "deviceType": device.kind,
            }),
        );

        if device.kind == StationKind::Window {
            match self.store.deactivate_window_for_device(&device.device_id) {
                Ok(Some(window)) => {
                    info!(device_id = %device.device_id, window_id = window.id, "Window deactivated")
                }
                Ok(None) => {}
                Err(e) => error!(
                    device_id = %device.device_id,
                    error = %e,
                    "Failed to deactivate window"
                ),
            }
        }
    }

    // =========================================================================
    // Shared Operations
    // =========================================================================

    /// Create a ticket and announce it to every station.
    pub fn create_ticket(&self, request: &CreateTicket) -> Result<Ticket, RouterError> {
        let ticket = self
            .store
            .create_ticket(request.service_id, request.printer_id.as_deref())?;
        self.hub
            .emit_to_all(events::TICKET_CREATED, json!({ "ticket": ticket }));
        Ok(ticket)
    }

    /// Move a ticket's print status forward and announce the change.
    ///
    /// Returns `false` if the ticket doesn't exist; stations still hear about it.
    pub fn update_print_status(&self, ticket_id: i64, status: PrintStatus) -> Result<bool, RouterError> {
        let updated = self.store.update_ticket_print_status(ticket_id, status)?;
        self.hub.emit_to_all(
            events::TICKET_PRINT_STATUS_UPDATED,
            json!({
                "ticketId": ticket_id,
                "printStatus": status,
                "updated": updated,
            }),
        );
        Ok(updated)
    }

    /// Clear the queue now and tell every station. `origin` names the requester in logs.
    pub fn force_reset(&self, origin: &str) -> Result<ManualResetReport, RouterError> {
        let report = self.reset.perform_manual_reset()?;
        info!(
            origin = %origin,
            tickets_cleared = report.tickets_cleared,
            "Forced reset requested"
        );
        self.hub.emit_to_all(
            events::RESET_COMPLETED,
            json!({
                "date": self.reset.today(),
                "ticketsCleared": report.tickets_cleared,
                "manual": true,
            }),
        );
        Ok(report)
    }

    // =========================================================================
    // Device Handlers
    // =========================================================================

    fn handle_device_register(
        &self,
        connection_id: &str,
        registration: DeviceRegistration,
    ) -> RouterResult {
        let device_id = registration.device_id.trim();
        if device_id.is_empty() {
            return Err(RouterError::InvalidRequest("deviceId is required".to_string()));
        }

        self.hub
            .bind_device(connection_id, device_id, registration.device_type)?;

        let window = match registration.device_type {
            StationKind::Window => Some(
                self.store
                    .register_window_for_device(device_id, registration.service_id)?,
            ),
            _ => None,
        };

        info!(
            connection_id = %connection_id,
            device_id = %device_id,
            kind = registration.device_type.as_str(),
            "Device registered"
        );

        self.hub.broadcast_except(
            connection_id,
            events::DEVICE_CONNECTED,
            json!({
                "deviceId": device_id,
                "deviceType": registration.device_type,
                "name": registration.name,
            }),
        );

        Ok(Some(Envelope::new(
            events::DEVICE_REGISTERED,
            json!({
                "deviceId": device_id,
                "deviceType": registration.device_type,
                "connectionId": connection_id,
                "window": window,
            }),
        )))
    }

    // =========================================================================
    // Print Handlers
    // =========================================================================

    fn handle_print_request(&self, request: RemotePrintRequest) -> RouterResult {
        let ack = self.broker.submit(request)?;
        Ok(Some(reply(events::PRINT_REQUEST_RECEIVED, &ack)))
    }

    fn handle_print_result(&self, response: RemotePrintResponse) -> RouterResult {
        self.broker.resolve(response);
        Ok(None)
    }

    fn handle_print_cancel(&self, cancel: CancelRequest) -> RouterResult {
        let result = self.broker.cancel(cancel.request_id());
        Ok(Some(reply(events::PRINT_REQUEST_CANCELLED, &result)))
    }

    // =========================================================================
    // Ticket Handlers
    // =========================================================================

    fn handle_ticket_create(&self, request: CreateTicket) -> RouterResult {
        self.create_ticket(&request)?;
        Ok(None)
    }

    fn handle_update_print_status(&self, request: UpdatePrintStatus) -> RouterResult {
        let status: PrintStatus = request
            .print_status
            .parse()
            .map_err(|e: crate::store::ParseStatusError| RouterError::InvalidRequest(e.to_string()))?;
        self.update_print_status(request.ticket_id, status)?;
        Ok(None)
    }

    fn handle_call_next(&self, request: CallNextTicket) -> RouterResult {
        let ticket = self
            .store
            .call_next_ticket(request.service_id, request.window_label.as_deref())?
            .ok_or_else(|| {
                RouterError::NotFound(format!(
                    "no pending ticket for service {}",
                    request.service_id
                ))
            })?;
        self.hub
            .emit_to_all(events::TICKET_CALLED, json!({ "ticket": ticket }));
        Ok(None)
    }

    fn handle_active_services(&self) -> RouterResult {
        let services = self.store.active_services()?;
        Ok(Some(Envelope::new(
            events::SERVICES_LIST,
            json!({ "services": services }),
        )))
    }

    // =========================================================================
    // Reset and Diagnostics Handlers
    // =========================================================================

    fn handle_reset_history(&self, query: HistoryQuery) -> RouterResult {
        let history = self.reset.history(query.limit)?;
        Ok(Some(Envelope::new(
            events::RESET_HISTORY,
            json!({ "count": history.len(), "history": history }),
        )))
    }

    fn handle_reset_force(&self, connection_id: &str) -> RouterResult {
        let report = self.force_reset(connection_id)?;
        Ok(Some(reply(events::RESET_RESULT, &report)))
    }

    fn handle_system_stats(&self) -> RouterResult {
        Ok(Some(Envelope::new(
            events::SYSTEM_STATS,
            json!({
                "database": self.store.stats()?,
                "connections": self.hub.connection_stats(),
                "print": self.broker.statistics(),
            }),
        )))
    }
}

fn reply<T: serde::Serialize>(event: &str, payload: &T) -> Envelope {
    Envelope::new(
        event,
        serde_json::to_value(payload).unwrap_or(Value::Null),
    )
}

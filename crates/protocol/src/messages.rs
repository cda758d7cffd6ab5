//! Realtime message definitions.
//!
//! Every frame on the realtime channel is a JSON [`Envelope`] of the form
//! `{"event": "<name>", "data": <payload>}`. This module defines the envelope
//! and the typed payloads of the events the coordinator understands.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Envelope wrapper for all realtime messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, see [`crate::events`].
    pub event: String,
    /// Event payload. Missing payloads decode as `null`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize the envelope to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.event.trim().is_empty() {
            return Err(ProtocolError::EmptyEventName);
        }
        Ok(envelope)
    }

    /// Decode the payload into a typed structure.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::InvalidPayload {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// Print Messages
// ============================================================================

/// Snapshot of the ticket a print request is about.
///
/// Field names stay snake_case on the wire; this is what kiosks render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub ticket_number: String,
    pub service_name: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printer_id: Option<String>,
}

/// A request to print a ticket on some display's printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePrintRequest {
    /// Caller-chosen request id, unique among pending requests.
    pub id: String,
    /// Ticket to print.
    pub ticket_data: TicketSnapshot,
    /// Printer the requester wants used.
    pub printer_id: String,
    /// Display name of that printer.
    pub printer_name: String,
    /// Device expected to execute the print, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<String>,
    /// Device that submitted the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device_id: Option<String>,
    /// Requester's ISO-8601 timestamp.
    pub timestamp: String,
}

/// Outcome of a print, reported by the executing display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePrintResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Acknowledgement that a print request was accepted and dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReceived {
    pub request_id: String,
    /// Always `"sent_to_displays"`.
    pub status: String,
    pub message: String,
    pub timestamp: String,
}

/// A print request was rejected or expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFailed {
    pub request_id: String,
    pub error: String,
    pub timestamp: String,
}

/// Snapshot of all pending print requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingList {
    pub count: usize,
    pub requests: Vec<RemotePrintRequest>,
    pub timestamp: String,
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCancelled {
    pub request_id: String,
    pub cancelled: bool,
    pub timestamp: String,
}

/// Payload of `print:cancel-request`.
///
/// Older kiosks send the bare request id, newer ones an object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CancelRequest {
    Id(String),
    #[serde(rename_all = "camelCase")]
    Object { request_id: String },
}

impl CancelRequest {
    /// The id of the request to cancel.
    pub fn request_id(&self) -> &str {
        match self {
            CancelRequest::Id(id) => id,
            CancelRequest::Object { request_id } => request_id,
        }
    }
}

// ============================================================================
// Device Messages
// ============================================================================

/// Role of a kiosk station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationKind {
    Customer,
    Window,
    Display,
    Admin,
}

impl StationKind {
    /// Wire name of the station kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            StationKind::Customer => "customer",
            StationKind::Window => "window",
            StationKind::Display => "display",
            StationKind::Admin => "admin",
        }
    }
}

/// Payload of `device:register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub device_id: String,
    pub device_type: StationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Service a window station serves, if already chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<i64>,
}

// ============================================================================
// Ticket Messages
// ============================================================================

/// Payload of `ticket:create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicket {
    pub service_id: i64,
    #[serde(default)]
    pub printer_id: Option<String>,
}

/// Payload of `ticket:update-print-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePrintStatus {
    pub ticket_id: i64,
    /// One of `pending`, `printing`, `printed`, `print_failed`.
    pub print_status: String,
}

/// Payload of `ticket:call-next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNextTicket {
    pub service_id: i64,
    #[serde(default)]
    pub window_label: Option<String>,
}

/// Payload of `reset:get-history`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

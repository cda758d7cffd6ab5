//! # Queue Coordinator Protocol Library
//!
//! Wire definitions shared by the coordinator and the kiosk stations.
//!
//! ## Overview
//!
//! - **Discovery**: JSON datagrams used on the UDP discovery port so stations
//!   can locate the coordinator without static configuration
//! - **Realtime messages**: the `{"event", "data"}` envelope and typed payloads
//!   carried over the realtime channel
//! - **Event names**: string constants for every realtime event
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{events, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::new(events::PRINT_CANCEL_REQUEST, json!("r1"));
//! let text = envelope.to_json().unwrap();
//! assert_eq!(Envelope::from_json(&text).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`discovery`]: UDP discovery messages
//! - [`messages`]: realtime envelope and payloads
//! - [`events`]: realtime event names
//! - [`error`]: Error types

pub mod discovery;
pub mod error;
pub mod events;
pub mod messages;

pub use discovery::{
    DiscoveryKind, DiscoveryMessage, DiscoveryProbe, Endpoints, ServerAnnouncement,
    ServerDescriptor, API_PORT, DEFAULT_SERVER_NAME, DISCOVERY_PORT, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION,
};
pub use error::{ProtocolError, Result};
pub use messages::{
    CallNextTicket, CancelRequest, CreateTicket, DeviceRegistration, Envelope, HistoryQuery,
    PendingList, RemotePrintRequest, RemotePrintResponse, RequestCancelled, RequestFailed,
    RequestReceived, StationKind, TicketSnapshot, UpdatePrintStatus,
};

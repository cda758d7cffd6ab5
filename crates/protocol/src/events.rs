//! Realtime event names.
//!
//! Stations and the coordinator exchange [`Envelope`](crate::Envelope)s whose
//! `event` field is one of these names.

// ============================================================================
// Print lifecycle
// ============================================================================

/// Station asks the coordinator to get a ticket printed.
pub const PRINT_REMOTE_REQUEST: &str = "print:remote-request";
/// Coordinator fans a print request out to every station.
pub const PRINT_EXECUTE_REMOTE: &str = "print:execute-remote";
/// A display reports the outcome of a print it executed.
pub const PRINT_REMOTE_RESULT: &str = "print:remote-result";
/// Acknowledgement sent back to the requester on submission.
pub const PRINT_REQUEST_RECEIVED: &str = "print:request-received";
/// A request could not be accepted, or expired without a result.
pub const PRINT_REQUEST_FAILED: &str = "print:request-failed";
/// Outcome broadcast once a display reported back.
pub const PRINT_REMOTE_COMPLETED: &str = "print:remote-completed";
pub const PRINT_GET_PENDING: &str = "print:get-pending";
pub const PRINT_PENDING_LIST: &str = "print:pending-list";
pub const PRINT_CANCEL_REQUEST: &str = "print:cancel-request";
pub const PRINT_REQUEST_CANCELLED: &str = "print:request-cancelled";

// ============================================================================
// Devices
// ============================================================================

pub const DEVICE_REGISTER: &str = "device:register";
pub const DEVICE_REGISTERED: &str = "device:registered";
pub const DEVICE_CONNECTED: &str = "device:connected";
pub const DEVICE_DISCONNECTED: &str = "device:disconnected";

// ============================================================================
// Tickets and services
// ============================================================================

pub const TICKET_CREATE: &str = "ticket:create";
pub const TICKET_CREATED: &str = "ticket:created";
pub const TICKET_UPDATE_PRINT_STATUS: &str = "ticket:update-print-status";
pub const TICKET_PRINT_STATUS_UPDATED: &str = "ticket:print-status-updated";
pub const TICKET_CALL_NEXT: &str = "ticket:call-next";
pub const TICKET_CALLED: &str = "ticket:called";
pub const TICKET_ERROR: &str = "ticket:error";
pub const SERVICES_GET_ACTIVE: &str = "services:get-active";
pub const SERVICES_LIST: &str = "services:list";

// ============================================================================
// Daily reset and diagnostics
// ============================================================================

pub const RESET_GET_STATUS: &str = "reset:get-status";
pub const RESET_STATUS: &str = "reset:status";
pub const RESET_GET_HISTORY: &str = "reset:get-history";
pub const RESET_HISTORY: &str = "reset:history";
pub const RESET_FORCE: &str = "reset:force";
pub const RESET_RESULT: &str = "reset:result";
/// Broadcast after the ticket queue was cleared.
pub const RESET_COMPLETED: &str = "reset:completed";
pub const SYSTEM_GET_STATS: &str = "system:get-stats";
pub const SYSTEM_STATS: &str = "system:stats";

/// Generic error reply for events the coordinator could not handle.
pub const ERROR: &str = "error";

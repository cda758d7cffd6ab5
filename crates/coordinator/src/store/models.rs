//! Records persisted by the store.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored enum column held a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

/// Implements text conversion and SQLite column mapping for a status enum.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Stored / wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Whether a service currently accepts tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
}

text_enum!(ServiceStatus, "service status", {
    Active => "active",
    Inactive => "inactive",
});

/// Queue lifecycle of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Pending,
    Called,
    Completed,
    Cancelled,
}

text_enum!(TicketStatus, "ticket status", {
    Pending => "pending",
    Called => "called",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl TicketStatus {
    /// Whether the queue may move from `self` to `next`.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        matches!(
            (self, next),
            (TicketStatus::Pending, TicketStatus::Called)
                | (TicketStatus::Called, TicketStatus::Completed)
                | (TicketStatus::Pending, TicketStatus::Cancelled)
                | (TicketStatus::Called, TicketStatus::Cancelled)
        )
    }
}

/// Printing lifecycle of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintStatus {
    Pending,
    Printing,
    Printed,
    PrintFailed,
}

text_enum!(PrintStatus, "print status", {
    Pending => "pending",
    Printing => "printing",
    Printed => "printed",
    PrintFailed => "print_failed",
});

impl PrintStatus {
    /// Position in the forward-only print lifecycle. Both outcomes share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            PrintStatus::Pending => 0,
            PrintStatus::Printing => 1,
            PrintStatus::Printed | PrintStatus::PrintFailed => 2,
        }
    }

    /// Whether moving from `self` to `next` goes strictly forward.
    pub fn can_advance_to(self, next: PrintStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// A service customers queue for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: ServiceStatus,
}

/// Fields for creating a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewService {
    pub name: String,
    pub description: Option<String>,
    pub status: ServiceStatus,
}

impl NewService {
    /// An active service without description.
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            status: ServiceStatus::Active,
        }
    }
}

/// Partial update of a service. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ServiceStatus>,
}

/// A counter window staffed by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: i64,
    pub number: i64,
    pub active: bool,
    pub assigned_service_id: Option<i64>,
    pub device_id: Option<String>,
}

/// A queue ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub ticket_number: String,
    pub service_id: i64,
    pub service_name: String,
    pub status: TicketStatus,
    pub print_status: PrintStatus,
    pub printer_id: Option<String>,
    pub created_at: String,
    pub called_at: Option<String>,
    pub window_label: Option<String>,
    pub position: Option<i64>,
}

impl Ticket {
    /// Snapshot handed to displays for printing.
    pub fn snapshot(&self) -> protocol::TicketSnapshot {
        protocol::TicketSnapshot {
            ticket_number: self.ticket_number.clone(),
            service_name: self.service_name.clone(),
            created_at: self.created_at.clone(),
            position: self.position,
            window_number: self
                .window_label
                .as_deref()
                .and_then(|label| label.parse().ok()),
            printer_id: self.printer_id.clone(),
        }
    }
}

/// Filter for listing tickets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicketFilter {
    pub service_id: Option<i64>,
    pub status: Option<TicketStatus>,
}

/// One row per calendar day on which the queue was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyResetRecord {
    pub id: i64,
    pub last_reset_date: String,
    pub last_reset_timestamp: String,
    pub tickets_reset: i64,
    pub pdfs_reset: i64,
    pub cache_reset: i64,
    pub created_at: String,
}

/// Row counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub services: i64,
    pub tickets: i64,
    pub pending_tickets: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_status_forward_only() {
        use PrintStatus::*;
        assert!(Pending.can_advance_to(Printing));
        assert!(Pending.can_advance_to(Printed));
        assert!(Printing.can_advance_to(PrintFailed));
        assert!(!Printed.can_advance_to(Pending));
        assert!(!Printed.can_advance_to(PrintFailed));
        assert!(!Printing.can_advance_to(Printing));
    }

    #[test]
    fn test_ticket_status_transitions() {
        use TicketStatus::*;
        assert!(Pending.can_transition_to(Called));
        assert!(Called.can_transition_to(Completed));
        assert!(Called.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(PrintStatus::PrintFailed.as_str(), "print_failed");
        assert_eq!("printed".parse::<PrintStatus>(), Ok(PrintStatus::Printed));
        let err = "lost".parse::<PrintStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown print status value: lost");
        assert_eq!(
            serde_json::to_string(&PrintStatus::PrintFailed).unwrap(),
            "\"print_failed\""
        );
    }
}

//! Daily reset engine.
//!
//! Guarantees the ticket queue is cleared at most once per calendar day
//! (automatic path) and lets an administrator force a clear at any time.
//! The `daily_resets.last_reset_date` uniqueness constraint backs this up
//! across processes sharing one database file.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, DateZone};
use crate::store::{DailyResetRecord, ResetApplied, ResetMode, Store, StoreError};

/// Default number of history entries returned.
pub const DEFAULT_HISTORY_LIMIT: u32 = 30;

/// Errors surfaced by reset operations.
#[derive(Debug, Error)]
pub enum ResetError {
    #[error("daily reset failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of the automatic reset check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The queue was cleared for `date`.
    Performed { date: String, tickets_reset: i64 },
    /// `date` already had a reset; nothing was touched.
    AlreadyDone { date: String },
}

/// Report returned to the administrator after a forced reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualResetReport {
    pub success: bool,
    pub tickets_cleared: i64,
    pub message: String,
}

/// Snapshot of the reset state for today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetStatus {
    pub today: String,
    pub needs_reset: bool,
    pub last_reset: Option<DailyResetRecord>,
}

/// Clears the ticket queue once per day.
pub struct DailyResetEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    zone: DateZone,
    history_limit: u32,
}

impl DailyResetEngine {
    /// Creates an engine deciding "today" in `zone`.
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, zone: DateZone) -> Self {
        Self {
            store,
            clock,
            zone,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Overrides the default history length.
    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }

    /// Today's date as `YYYY-MM-DD`.
    pub fn today(&self) -> String {
        self.clock
            .calendar_date(self.zone)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Clear the queue if today has no reset yet.
    pub fn perform_if_needed(&self) -> Result<ResetOutcome, ResetError> {
        let date = self.today();
        let timestamp = self.clock.now_iso();

        match self
            .store
            .apply_daily_reset(&date, &timestamp, ResetMode::IfMissing)
        {
            Ok(ResetApplied::Cleared { tickets_reset }) => {
                info!(date = %date, tickets_reset, "Daily reset performed");
                Ok(ResetOutcome::Performed {
                    date,
                    tickets_reset,
                })
            }
            Ok(ResetApplied::AlreadyRecorded) => {
                debug!(date = %date, "Daily reset already done");
                Ok(ResetOutcome::AlreadyDone { date })
            }
            Err(StoreError::ResetConflict(_)) => {
                warn!(date = %date, "Another writer recorded today's reset first");
                Ok(ResetOutcome::AlreadyDone { date })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Startup variant of [`perform_if_needed`](Self::perform_if_needed).
    ///
    /// Failures are logged and swallowed so the server still starts.
    pub fn run_startup_check(&self) -> Option<ResetOutcome> {
        match self.perform_if_needed() {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "Daily reset check failed during startup");
                None
            }
        }
    }

    /// Clear the queue now, whether or not today already had a reset.
    ///
    /// Today's record is replaced, never duplicated.
    pub fn perform_manual_reset(&self) -> Result<ManualResetReport, ResetError> {
        let date = self.today();
        let timestamp = self.clock.now_iso();

        match self
            .store
            .apply_daily_reset(&date, &timestamp, ResetMode::Force)?
        {
            ResetApplied::Cleared { tickets_reset } => {
                info!(date = %date, tickets_reset, "Manual reset performed");
                Ok(ManualResetReport {
                    success: true,
                    tickets_cleared: tickets_reset,
                    message: format!("Cleared {} tickets for {}", tickets_reset, date),
                })
            }
            // Force mode never skips.
            ResetApplied::AlreadyRecorded => Ok(ManualResetReport {
                success: true,
                tickets_cleared: 0,
                message: format!("Reset for {} already recorded", date),
            }),
        }
    }

    /// Whether today still needs its reset.
    pub fn is_reset_needed(&self) -> Result<bool, ResetError> {
        Ok(self.store.reset_for_date(&self.today())?.is_none())
    }

    /// Past resets, most recent first. `None` uses the configured limit.
    pub fn history(&self, limit: Option<u32>) -> Result<Vec<DailyResetRecord>, ResetError> {
        Ok(self
            .store
            .reset_history(limit.unwrap_or(self.history_limit))?)
    }

    /// The most recent reset, if any.
    pub fn last_reset(&self) -> Result<Option<DailyResetRecord>, ResetError> {
        Ok(self.store.last_reset()?)
    }

    /// Today's date, whether it needs a reset, and the last reset.
    pub fn status(&self) -> Result<ResetStatus, ResetError> {
        let today = self.today();
        let needs_reset = self.store.reset_for_date(&today)?.is_none();
        Ok(ResetStatus {
            today,
            needs_reset,
            last_reset: self.last_reset()?,
        })
    }
}

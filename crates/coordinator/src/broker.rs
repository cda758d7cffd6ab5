//! Print job broker.
//!
//! Tracks remote print requests between submission and resolution. A request
//! is broadcast to every station; whichever display executes it first reports
//! the outcome, and that first resolution removes the job. Later resolutions
//! for the same id are still relayed but no longer touch the working set.
//!
//! Jobs nobody resolves are dropped by [`PrintJobBroker::sweep_expired`] once
//! they are older than the TTL, measured from the server's receive time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::events;
use protocol::{
    PendingList, RemotePrintRequest, RemotePrintResponse, RequestCancelled, RequestFailed,
    RequestReceived,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::hub::RealtimeHub;

/// Default age after which an unresolved job is dropped.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(5 * 60);

/// `status` of every accepted request.
pub const STATUS_SENT_TO_DISPLAYS: &str = "sent_to_displays";

/// Reasons a submission is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("print request has no id")]
    MissingRequestId,

    #[error("print request {0} is already pending")]
    DuplicateRequest(String),
}

/// Broker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintStatistics {
    pub pending_requests: usize,
    pub total_submitted: u64,
    pub total_resolved: u64,
    pub total_cancelled: u64,
    pub total_expired: u64,
    pub last_sweep: Option<String>,
}

struct PendingJob {
    request: RemotePrintRequest,
    received_at: DateTime<Utc>,
}

/// Owns the set of in-flight print requests.
pub struct PrintJobBroker {
    jobs: DashMap<String, PendingJob>,
    hub: Arc<RealtimeHub>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    total_submitted: AtomicU64,
    total_resolved: AtomicU64,
    total_cancelled: AtomicU64,
    total_expired: AtomicU64,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl PrintJobBroker {
    pub fn new(hub: Arc<RealtimeHub>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(hub, clock, DEFAULT_JOB_TTL)
    }

    pub fn with_ttl(hub: Arc<RealtimeHub>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            hub,
            clock,
            ttl,
            total_submitted: AtomicU64::new(0),
            total_resolved: AtomicU64::new(0),
            total_cancelled: AtomicU64::new(0),
            total_expired: AtomicU64::new(0),
            last_sweep: Mutex::new(None),
        }
    }

    /// Accept a request and fan it out to every station.
    ///
    /// Emits `print:execute-remote` (the request plus `receivedAt`) to all
    /// stations and returns the acknowledgement for the submitter.
    pub fn submit(&self, mut request: RemotePrintRequest) -> Result<RequestReceived, BrokerError> {
        let request_id = request.id.trim().to_string();
        if request_id.is_empty() {
            return Err(BrokerError::MissingRequestId);
        }
        // Stations see, list, resolve and cancel the job by the trimmed id.
        request.id = request_id.clone();

        let received_at = self.clock.now();
        let mut payload = serde_json::to_value(&request).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut payload {
            map.insert(
                "receivedAt".to_string(),
                Value::String(crate::clock::iso8601(received_at)),
            );
        }

        match self.jobs.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                warn!(request_id = %request_id, "Duplicate print request rejected");
                return Err(BrokerError::DuplicateRequest(request_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingJob {
                    request,
                    received_at,
                });
            }
        }
        self.total_submitted.fetch_add(1, Ordering::Relaxed);

        let reached = self.hub.emit_to_all(events::PRINT_EXECUTE_REMOTE, payload);
        info!(request_id = %request_id, stations = reached, "Print request dispatched");

        Ok(RequestReceived {
            request_id,
            status: STATUS_SENT_TO_DISPLAYS.to_string(),
            message: "Print request sent to display devices".to_string(),
            timestamp: self.clock.now_iso(),
        })
    }

    /// Record a print outcome and relay it to every station.
    ///
    /// Returns whether a pending job was removed. Unknown ids are relayed all
    /// the same.
    pub fn resolve(&self, mut response: RemotePrintResponse) -> bool {
        response.request_id = response.request_id.trim().to_string();
        let removed = self.jobs.remove(&response.request_id).is_some();
        if removed {
            self.total_resolved.fetch_add(1, Ordering::Relaxed);
            info!(
                request_id = %response.request_id,
                success = response.success,
                "Print request resolved"
            );
        } else {
            debug!(request_id = %response.request_id, "Resolution for unknown print request");
        }

        let payload = serde_json::to_value(&response).unwrap_or(Value::Null);
        self.hub.emit_to_all(events::PRINT_REMOTE_COMPLETED, payload);
        removed
    }

    /// Drop a pending request. `cancelled` tells whether one was removed.
    pub fn cancel(&self, request_id: &str) -> RequestCancelled {
        let request_id = request_id.trim();
        let cancelled = self.jobs.remove(request_id).is_some();
        if cancelled {
            self.total_cancelled.fetch_add(1, Ordering::Relaxed);
            info!(request_id = %request_id, "Print request cancelled");
        }
        RequestCancelled {
            request_id: request_id.to_string(),
            cancelled,
            timestamp: self.clock.now_iso(),
        }
    }

    /// Snapshot of pending requests, oldest first.
    pub fn list_pending(&self) -> PendingList {
        let mut jobs: Vec<(DateTime<Utc>, RemotePrintRequest)> = self
            .jobs
            .iter()
            .map(|job| (job.received_at, job.request.clone()))
            .collect();
        jobs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        let requests: Vec<RemotePrintRequest> = jobs.into_iter().map(|(_, r)| r).collect();
        PendingList {
            count: requests.len(),
            requests,
            timestamp: self.clock.now_iso(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.jobs.contains_key(request_id.trim())
    }

    /// Remove jobs older than the TTL and report each as failed to all stations.
    ///
    /// Returns the ids that were removed.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|job| {
                now.signed_duration_since(job.received_at)
                    .to_std()
                    .map(|age| age > self.ttl)
                    .unwrap_or(false)
            })
            .map(|job| job.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for request_id in expired {
            if self.jobs.remove(&request_id).is_none() {
                continue;
            }
            self.total_expired.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %request_id, "Print request expired without a result");

            let failed = RequestFailed {
                request_id: request_id.clone(),
                error: format!(
                    "Print request expired after {} seconds without a result",
                    self.ttl.as_secs()
                ),
                timestamp: self.clock.now_iso(),
            };
            let payload = serde_json::to_value(&failed).unwrap_or(Value::Null);
            self.hub.emit_to_all(events::PRINT_REQUEST_FAILED, payload);
            removed.push(request_id);
        }

        if let Ok(mut last) = self.last_sweep.lock() {
            *last = Some(now);
        }
        removed
    }

    pub fn statistics(&self) -> PrintStatistics {
        PrintStatistics {
            pending_requests: self.jobs.len(),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_resolved: self.total_resolved.load(Ordering::Relaxed),
            total_cancelled: self.total_cancelled.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
            last_sweep: self
                .last_sweep
                .lock()
                .ok()
                .and_then(|last| (*last).map(crate::clock::iso8601)),
        }
    }
}

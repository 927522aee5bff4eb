//! Worker loop: one logical client issuing requests and tallying outcomes.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderValue;
use http::StatusCode;
use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::capture::{CaptureSink, CapturedFailure};
use crate::template::{RequestTemplate, Target};
use crate::transport::{Connector, Session, TransportError};

/// Status codes counted as success: 200 OK through 226 IM Used.
pub const SUCCESS_BAND: RangeInclusive<u16> = 200..=226;

pub fn is_success(status: StatusCode) -> bool {
    SUCCESS_BAND.contains(&status.as_u16())
}

// ---------------------------------------------------------------------------
// WorkerTally / WorkerResult
// ---------------------------------------------------------------------------

/// A worker's outcome counters.
///
/// Each slot is written only by the worker that owns it. Atomics let the
/// reporter take a best-effort snapshot while the worker is still running.
#[derive(Debug, Default)]
pub struct WorkerTally {
    requests: AtomicU64,
    succeeded: AtomicU64,
    network_failed: AtomicU64,
    bad_status: AtomicU64,
}

impl WorkerTally {
    /// Count one issued request and return the new total.
    fn record_issued(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_network_failure(&self) {
        self.network_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bad_status(&self) {
        self.bad_status.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerResult {
        WorkerResult {
            requests: self.requests.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            network_failed: self.network_failed.load(Ordering::Relaxed),
            bad_status: self.bad_status.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of one worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerResult {
    pub requests: u64,
    pub succeeded: u64,
    pub network_failed: u64,
    pub bad_status: u64,
}

impl WorkerResult {
    /// Every issued request has exactly one recorded outcome.
    pub fn is_consistent(&self) -> bool {
        self.requests == self.succeeded + self.network_failed + self.bad_status
    }
}

/// Allocate one tally slot per worker.
pub fn tally_slots(clients: usize) -> Arc<[WorkerTally]> {
    (0..clients).map(|_| WorkerTally::default()).collect()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// State shared by every worker of a run.
#[derive(Clone)]
pub struct WorkerShared {
    pub run_id: Uuid,
    pub template: Arc<RequestTemplate>,
    pub connector: Connector,
    pub tallies: Arc<[WorkerTally]>,
    pub capture: Option<Arc<CaptureSink>>,
    /// Per-worker request quota; `None` runs until the task is abandoned.
    pub quota: Option<u64>,
}

/// One client loop. States are only running and completed: a failed
/// request is counted and the loop moves on, nothing is retried.
pub struct Worker {
    id: usize,
    shared: WorkerShared,
    session: Session,
}

impl Worker {
    pub fn new(id: usize, shared: WorkerShared) -> Self {
        let session = Session::new(shared.connector.clone(), shared.template.keep_alive());
        Self {
            id,
            shared,
            session,
        }
    }

    fn tally(&self) -> &WorkerTally {
        &self.shared.tallies[self.id]
    }

    fn quota_reached(&self) -> bool {
        match self.shared.quota {
            Some(quota) => self.tally().requests() >= quota,
            None => false,
        }
    }

    /// Cycle through the targets in order until the quota is reached.
    ///
    /// In duration mode this never returns on its own.
    pub async fn run(mut self) -> WorkerResult {
        debug!(worker = self.id, "worker started");
        let template = self.shared.template.clone();

        'run: loop {
            for target in template.targets() {
                if self.quota_reached() {
                    break 'run;
                }
                self.issue(&template, target).await;
            }
        }

        let result = self.tally().snapshot();
        debug!(
            worker = self.id,
            requests = result.requests,
            succeeded = result.succeeded,
            "worker completed"
        );
        result
    }

    async fn issue(&mut self, template: &RequestTemplate, target: &Target) {
        let outcome = match template.request_for(target) {
            Ok(req) => self.session.execute(target, req).await,
            Err(e) => Err(TransportError::from(e)),
        };

        let request_number = self.tally().record_issued();

        match outcome {
            Ok(exchange) if is_success(exchange.status) => {
                self.tally().record_success();
            }
            Ok(exchange) => {
                self.tally().record_bad_status();
                trace!(worker = self.id, url = %target, status = %exchange.status, "bad status");
                self.capture(
                    request_number,
                    exchange.status.as_u16(),
                    target,
                    exchange.content_type.as_ref(),
                    &exchange.body,
                )
                .await;
            }
            Err(e) => {
                self.tally().record_network_failure();
                debug!(worker = self.id, url = %target, error = %e, "request failed");
                let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
                self.capture(request_number, status, target, None, &Bytes::new())
                    .await;
                // A refused connection can complete without ever going
                // pending; yield so tight failure loops stay preemptible.
                tokio::task::yield_now().await;
            }
        }
    }

    async fn capture(
        &self,
        request_number: u64,
        status: u16,
        target: &Target,
        content_type: Option<&HeaderValue>,
        body: &Bytes,
    ) {
        let Some(sink) = &self.shared.capture else {
            return;
        };
        let record = CapturedFailure::new(
            self.shared.run_id,
            self.id,
            request_number as i64,
            status,
            target.to_string(),
            content_type,
            body,
        );
        if let Err(e) = sink.append(&record).await {
            warn!(worker = self.id, error = %e, "failed to capture response, record dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

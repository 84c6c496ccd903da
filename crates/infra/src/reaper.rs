//! Expiry reaper: returns the stock of reservations nobody finalized in time.
//!
//! Each sweep lists PENDING reservations past their deadline and expires them
//! through the engine, so every expiry takes the same claim-then-write path as
//! a cancel. Overlapping sweeps (several reaper instances, or a sweep racing a
//! client cancel) are harmless: only one claim per reservation can win.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use stockguard_events::{EventBus, EventEnvelope};
use stockguard_inventory::InventoryEvent;

use crate::engine::ReservationEngine;
use crate::error::ReservationError;
use crate::lock::LockManager;
use crate::store::{ReservationStore, VersionedStore};
use crate::workers::WorkerHandle;

/// Outcome counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Candidates returned by the store.
    pub scanned: usize,
    /// Reservations this sweep moved to EXPIRED.
    pub expired: usize,
    /// Candidates somebody else finalized first.
    pub skipped: usize,
    /// Candidates left PENDING because of an error; retried next sweep.
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.scanned += other.scanned;
        self.expired += other.expired;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Shutdown handle for a spawned reaper thread.
pub type ReaperHandle = WorkerHandle;

pub struct ExpiryReaper<V, R, L, B> {
    engine: Arc<ReservationEngine<V, R, L, B>>,
    batch_size: usize,
    poll_interval: Duration,
}

impl<V, R, L, B> core::fmt::Debug for ExpiryReaper<V, R, L, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExpiryReaper")
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl<V, R, L, B> ExpiryReaper<V, R, L, B>
where
    V: VersionedStore + 'static,
    R: ReservationStore + 'static,
    L: LockManager + 'static,
    B: EventBus<EventEnvelope<InventoryEvent>> + 'static,
{
    /// Batch size and poll interval come from the engine's config.
    pub fn new(engine: Arc<ReservationEngine<V, R, L, B>>) -> Self {
        let batch_size = engine.config().reaper_batch_size.max(1);
        let poll_interval = engine.config().reaper_poll_interval;
        Self {
            engine,
            batch_size,
            poll_interval,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Expire at most one batch of due reservations.
    pub fn sweep_once(&self) -> SweepReport {
        let now = self.engine.clock().now();
        let due = match self.engine.reservations().list_expired(now, self.batch_size) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to list expired reservations");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };

        for reservation in due {
            match self.engine.expire(&reservation.order_id) {
                Ok(f) if f.applied => report.expired += 1,
                Ok(_) => report.skipped += 1,
                // Cancelled or confirmed between listing and claiming.
                Err(ReservationError::InvalidStateTransition(_)) => report.skipped += 1,
                Err(e) => {
                    warn!(order_id = %reservation.order_id, error = %e, "expiry failed, will retry");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        report
    }

    /// Sweep repeatedly until a batch comes back short of `batch_size` or
    /// nothing in a full batch could be progressed.
    pub fn sweep_all(&self) -> SweepReport {
        let mut total = SweepReport::default();
        loop {
            let report = self.sweep_once();
            total.merge(report);
            if report.scanned < self.batch_size || report.expired + report.skipped == 0 {
                return total;
            }
        }
    }

    /// Run sweeps on a background thread every `poll_interval`.
    pub fn spawn(self) -> io::Result<ReaperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = "expiry-reaper";

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(interval_ms = crate::config::millis(self.poll_interval), "reaper started");
                loop {
                    self.sweep_all();
                    match shutdown_rx.recv_timeout(self.poll_interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("reaper stopped");
            })?;

        Ok(WorkerHandle::new(name, shutdown_tx, join))
    }
}

//! The flow controller contract.
//!
//! A controller decides whether one request may proceed, possibly blocking the
//! calling thread. Controllers are consulted in ascending [`priority`] order by
//! the pipeline:
//!
//! ```text
//!   request ──▶ rate controllers ──▶ small-capacity ──▶ large-capacity ──▶ handler
//!              (i64::MIN + rate)     concurrency         concurrency
//! ```
//!
//! Whatever a controller records about a request lives in that request's
//! [`Ticket`], not in thread-local state, so completion can happen on any
//! thread.
//!
//! [`priority`]: FlowController::priority

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sluice_core::{PartitionKey, Request, RequestId};
use tracing::warn;

use crate::error::{FlowError, FlowResult};

/// Per-request, per-controller admission record.
///
/// The pipeline creates one ticket for each controller it consults and hands
/// it back to that controller's [`FlowController::on_complete`] exactly once.
/// A fresh ticket records nothing, so completing it is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    request_id: RequestId,
    key: Option<PartitionKey>,
    holds_slot: bool,
    pinned: bool,
}

impl Ticket {
    /// Creates an empty ticket for `request_id`.
    #[must_use]
    pub const fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            key: None,
            holds_slot: false,
            pinned: false,
        }
    }

    /// Request this ticket belongs to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Partition key computed for the request, if the controller is keyed.
    #[must_use]
    pub const fn key(&self) -> Option<&PartitionKey> {
        self.key.as_ref()
    }

    /// Records the partition key.
    pub fn set_key(&mut self, key: PartitionKey) {
        self.key = Some(key);
    }

    /// Whether the request holds a blocker slot.
    #[must_use]
    pub const fn holds_slot(&self) -> bool {
        self.holds_slot
    }

    /// Records that the request now holds a blocker slot.
    pub fn mark_slot(&mut self) {
        self.holds_slot = true;
    }

    /// Whether the request pins per-key state against reclamation.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Records that the request pinned per-key state.
    pub fn mark_pinned(&mut self) {
        self.pinned = true;
    }
}

/// An admission-control policy.
pub trait FlowController: Send + Sync + fmt::Debug {
    /// Human-readable name, used in logs, stats and rejections.
    fn name(&self) -> &str;

    /// Evaluation order; lower runs first.
    fn priority(&self) -> i64;

    /// Decides whether `request` may proceed, blocking up to `timeout`.
    ///
    /// `None` means wait forever. Returns `Ok(false)` when the request was not
    /// admitted within the timeout. Whatever the outcome, `ticket` must be
    /// passed to [`on_complete`](Self::on_complete) afterwards.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::TooManyRequests` when a rate limit rejects the
    /// request outright. Interrupted waits are reported as `Ok(false)`.
    fn try_admit(
        &self,
        request: &mut dyn Request,
        timeout: Option<Duration>,
        ticket: &mut Ticket,
    ) -> FlowResult<bool>;

    /// Releases whatever `ticket` records. A ticket that records nothing is
    /// ignored.
    fn on_complete(&self, ticket: Ticket);

    /// Current statistics.
    fn stats(&self) -> ControllerStats;

    /// Removes idle per-key state older than the configured age, as of
    /// `now_ms`. Returns the number of keys removed.
    fn reclaim(&self, _now_ms: u64) -> usize {
        0
    }

    /// Interrupts waiters and refuses further admissions.
    fn close(&self) {}
}

/// Snapshot of one controller's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Controller name.
    pub name: String,
    /// Evaluation priority.
    pub priority: i64,
    /// Configured capacity (concurrency) or limit (rate).
    pub capacity: u64,
    /// Requests currently holding a slot.
    pub running: usize,
    /// Requests currently waiting.
    pub queued: usize,
    /// Highest concurrency observed in any single scope.
    pub peak_running: usize,
    /// Per-key entries currently tracked.
    pub keys: usize,
    /// Requests admitted so far.
    pub admitted: u64,
    /// Requests rejected outright.
    pub rejected: u64,
    /// Requests whose wait expired.
    pub timed_out: u64,
}

/// Atomic outcome counters shared by the built-in controllers.
#[derive(Debug, Default)]
pub struct StatsCounters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

impl StatsCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Counts one admission.
    pub fn admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one rejection.
    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one expired wait.
    pub fn timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into `stats`.
    pub fn fill(&self, stats: &mut ControllerStats) {
        stats.admitted = self.admitted.load(Ordering::Relaxed);
        stats.rejected = self.rejected.load(Ordering::Relaxed);
        stats.timed_out = self.timed_out.load(Ordering::Relaxed);
    }
}

/// Interprets a blocker's answer for `controller`.
///
/// An interrupted wait is logged and becomes a plain non-admission.
pub(crate) fn settle_wait(
    controller: &str,
    request: RequestId,
    outcome: FlowResult<bool>,
    counters: &StatsCounters,
) -> bool {
    match outcome {
        Ok(true) => {
            counters.admitted();
            true
        }
        Ok(false) => {
            counters.timed_out();
            false
        }
        Err(FlowError::Interrupted) => {
            warn!(controller, request = %request, "wait interrupted, request not admitted");
            counters.rejected();
            false
        }
        Err(e) => {
            warn!(
                controller,
                request = %request,
                error = %e,
                "blocker failed, request not admitted"
            );
            counters.rejected();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ticket_records_nothing() {
        let ticket = Ticket::new(RequestId::new(9));
        assert_eq!(ticket.request_id(), RequestId::new(9));
        assert!(ticket.key().is_none());
        assert!(!ticket.holds_slot());
        assert!(!ticket.is_pinned());
    }

    #[test]
    fn test_settle_wait_counts_outcomes() {
        let counters = StatsCounters::new();
        let id = RequestId::new(1);
        assert!(settle_wait("c", id, Ok(true), &counters));
        assert!(!settle_wait("c", id, Ok(false), &counters));
        assert!(!settle_wait("c", id, Err(FlowError::Interrupted), &counters));

        let mut stats = ControllerStats::default();
        counters.fill(&mut stats);
        assert_eq!((stats.admitted, stats.timed_out, stats.rejected), (1, 1, 1));
    }
}

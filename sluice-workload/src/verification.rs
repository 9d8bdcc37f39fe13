//! Verification logic for detecting flow-control violations.
//!
//! Checks the invariants a load run must never break:
//! - Capacity (a controller observed more running requests than allowed)
//! - Global concurrency (clients saw more requests in flight than the
//!   tightest global limit)
//! - Drain (requests still running or queued once every client finished)
//! - Accounting (every request sent got exactly one outcome)

use std::fmt;

use sluice_flow::{ControllerStats, FlowConfig};

use crate::profiles::WorkloadProfile;
use crate::workload::WorkloadStats;

/// A violation of an expected property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A controller admitted more concurrent requests than its capacity.
    CapacityExceeded {
        /// Controller name.
        controller: String,
        /// Configured capacity.
        capacity: u64,
        /// Highest concurrency the controller observed.
        peak: usize,
    },

    /// Clients held more requests at once than the tightest global limit.
    GlobalConcurrencyExceeded {
        /// Smallest global capacity configured.
        limit: usize,
        /// Highest concurrency the clients observed.
        observed: usize,
    },

    /// A controller still holds requests after the run.
    NotDrained {
        /// Controller name.
        controller: String,
        /// Requests still running.
        running: usize,
        /// Requests still queued.
        queued: usize,
    },

    /// Outcomes do not add up to the requests sent.
    LostRequests {
        /// Requests sent.
        expected: u64,
        /// Outcomes recorded.
        observed: u64,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded {
                controller,
                capacity,
                peak,
            } => write!(
                f,
                "Capacity exceeded: {controller} ran {peak} requests at once, capacity {capacity}"
            ),
            Self::GlobalConcurrencyExceeded { limit, observed } => write!(
                f,
                "Global concurrency exceeded: clients held {observed} requests at once, \
                 limit {limit}"
            ),
            Self::NotDrained {
                controller,
                running,
                queued,
            } => write!(
                f,
                "Not drained: {controller} still has {running} running and {queued} queued"
            ),
            Self::LostRequests { expected, observed } => write!(
                f,
                "Lost requests: sent {expected}, recorded {observed} outcomes"
            ),
        }
    }
}

/// Verification runner that checks all properties.
pub struct Verification;

impl Verification {
    /// Runs all verification checks against a finished run.
    #[must_use]
    pub fn verify(profile: &WorkloadProfile, stats: &WorkloadStats) -> Vec<Violation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_accounting(profile.total_requests(), stats.outcomes()));
        violations.extend(Self::check_capacity(&stats.controllers));
        violations.extend(Self::check_global_concurrency(&profile.flow, stats.peak_in_flight));
        violations.extend(Self::check_drained(&stats.controllers));

        violations
    }

    /// Checks that every request sent got an outcome.
    #[must_use]
    pub fn check_accounting(expected: u64, observed: u64) -> Option<Violation> {
        (expected != observed).then_some(Violation::LostRequests { expected, observed })
    }

    /// Checks that no controller ran more requests than its capacity.
    ///
    /// Rate controllers never hold slots, so their peak stays zero.
    #[must_use]
    pub fn check_capacity(controllers: &[ControllerStats]) -> Vec<Violation> {
        controllers
            .iter()
            .filter(|c| c.peak_running as u64 > c.capacity)
            .map(|c| Violation::CapacityExceeded {
                controller: c.name.clone(),
                capacity: c.capacity,
                peak: c.peak_running,
            })
            .collect()
    }

    /// Checks client-observed concurrency against the smallest `global`
    /// capacity in `flow`.
    #[must_use]
    pub fn check_global_concurrency(flow: &FlowConfig, observed: usize) -> Option<Violation> {
        let limit = flow
            .controllers
            .iter()
            .filter(|c| c.strategy == "global")
            .filter_map(|c| c.capacity)
            .min()?;
        (observed > limit).then_some(Violation::GlobalConcurrencyExceeded { limit, observed })
    }

    /// Checks that every controller is idle.
    #[must_use]
    pub fn check_drained(controllers: &[ControllerStats]) -> Vec<Violation> {
        controllers
            .iter()
            .filter(|c| c.running > 0 || c.queued > 0)
            .map(|c| Violation::NotDrained {
                controller: c.name.clone(),
                running: c.running,
                queued: c.queued,
            })
            .collect()
    }
}

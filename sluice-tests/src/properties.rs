//! Property definitions and checkers for flow-control tests.
//!
//! Properties are invariants that must hold while many threads drive a
//! pipeline. Probes record what the threads observe; checkers turn those
//! observations into violations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sluice_flow::FlowPipeline;

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a flow-control property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// More requests ran at once than a scope allows.
    CapacityExceeded {
        /// The scope (controller or key).
        scope: String,
        /// The configured capacity.
        capacity: usize,
        /// The highest concurrency observed.
        observed: usize,
    },
    /// Waiters were admitted in the wrong order.
    OrderViolated {
        /// Expected admission order.
        expected: Vec<String>,
        /// Observed admission order.
        actual: Vec<String>,
    },
    /// A controller still holds slots or waiters after all requests finished.
    NotDrained {
        /// The controller.
        controller: String,
        /// Requests still running.
        running: usize,
        /// Requests still queued.
        queued: usize,
    },
}

impl fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded {
                scope,
                capacity,
                observed,
            } => write!(f, "{scope}: {observed} concurrent requests, capacity {capacity}"),
            Self::OrderViolated { expected, actual } => {
                write!(f, "admission order {actual:?}, expected {expected:?}")
            }
            Self::NotDrained {
                controller,
                running,
                queued,
            } => write!(f, "{controller}: {running} running and {queued} queued after drain"),
        }
    }
}

// ============================================================================
// Concurrency Probe
// ============================================================================

/// Counts requests inside a critical section per scope and remembers the
/// highest count seen.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    scopes: Mutex<BTreeMap<String, (usize, usize)>>,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request entering `scope`.
    pub fn enter(&self, scope: &str) {
        let mut scopes = self.scopes.lock();
        let (current, peak) = scopes.entry(scope.to_string()).or_default();
        *current += 1;
        *peak = (*peak).max(*current);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request leaving `scope`.
    pub fn exit(&self, scope: &str) {
        let mut scopes = self.scopes.lock();
        if let Some((current, _)) = scopes.get_mut(scope) {
            *current = current.saturating_sub(1);
        }
    }

    /// Highest concurrency seen in `scope`.
    #[must_use]
    pub fn peak(&self, scope: &str) -> usize {
        self.scopes.lock().get(scope).map_or(0, |(_, peak)| *peak)
    }

    /// Number of entries recorded across all scopes.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Checks that no scope exceeded `capacity`.
    #[must_use]
    pub fn check_capacity(&self, capacity: usize) -> Vec<PropertyViolation> {
        self.scopes
            .lock()
            .iter()
            .filter(|(_, (_, peak))| *peak > capacity)
            .map(|(scope, (_, peak))| PropertyViolation::CapacityExceeded {
                scope: scope.clone(),
                capacity,
                observed: *peak,
            })
            .collect()
    }
}

// ============================================================================
// Checkers
// ============================================================================

/// Checks that `actual` lists the same admissions as `expected`, in order.
#[must_use]
pub fn check_order<S: AsRef<str>>(expected: &[S], actual: &[S]) -> Option<PropertyViolation> {
    let expected: Vec<String> = expected.iter().map(|s| s.as_ref().to_string()).collect();
    let actual: Vec<String> = actual.iter().map(|s| s.as_ref().to_string()).collect();
    (expected != actual).then_some(PropertyViolation::OrderViolated { expected, actual })
}

/// Checks that every controller of `pipeline` is idle.
#[must_use]
pub fn check_drained(pipeline: &FlowPipeline) -> Vec<PropertyViolation> {
    pipeline
        .stats()
        .into_iter()
        .filter(|s| s.running > 0 || s.queued > 0)
        .map(|s| PropertyViolation::NotDrained {
            controller: s.name,
            running: s.running,
            queued: s.queued,
        })
        .collect()
}

/// Checks that no controller of `pipeline` ever ran more than its capacity in
/// one scope. Rate controllers report no running requests and always pass.
#[must_use]
pub fn check_peak_within_capacity(pipeline: &FlowPipeline) -> Vec<PropertyViolation> {
    pipeline
        .stats()
        .into_iter()
        .filter(|s| s.peak_running as u64 > s.capacity)
        .map(|s| PropertyViolation::CapacityExceeded {
            scope: s.name,
            capacity: usize::try_from(s.capacity).unwrap_or(usize::MAX),
            observed: s.peak_running,
        })
        .collect()
}

/// Result of checking all properties.
#[derive(Debug, Clone, Default)]
pub struct PropertyCheckResult {
    /// All violations found.
    pub violations: Vec<PropertyViolation>,
}

impl PropertyCheckResult {
    /// Returns true if no violations were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Returns the total number of violations.
    #[must_use]
    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }
}

/// Runs the pipeline-level checks once every request has finished.
#[must_use]
pub fn check_all_after_drain(pipeline: &FlowPipeline) -> PropertyCheckResult {
    let mut violations = check_drained(pipeline);
    violations.extend(check_peak_within_capacity(pipeline));
    PropertyCheckResult { violations }
}

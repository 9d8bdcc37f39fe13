//! Stale per-key state reclamation.
//!
//! Keyed controllers create state lazily for every new key. Keys derived from
//! volatile identifiers (a fresh cookie for each cookie-less client) would
//! grow those maps forever, so idle entries are swept:
//!
//! - inline, from the admission path, when [`ReclaimTrigger`] says a sweep is
//!   due: either more than `max_keys` entries exist and `min_interval_ms` has
//!   passed since the last sweep, or `max_interval_ms` has passed regardless;
//! - on demand through `FlowPipeline::reclaim_now`;
//! - periodically, by a [`Reclaimer`] thread.
//!
//! A sweep removes an entry only when nothing runs, waits or holds it and it
//! was last touched at least `max_age_ms` ago.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_core::Limits;
use tracing::{debug, info};

use crate::error::{FlowError, FlowResult};
use crate::pipeline::FlowPipeline;

/// When and what to reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimPolicy {
    /// Key count above which a sweep becomes eligible.
    pub max_keys: usize,
    /// Minimum time between key-count-triggered sweeps.
    pub min_interval_ms: u64,
    /// Maximum time between sweeps.
    pub max_interval_ms: u64,
    /// Idle age after which an entry may be removed.
    pub max_age_ms: u64,
}

impl ReclaimPolicy {
    /// Policy derived from system limits.
    #[must_use]
    pub const fn from_limits(limits: &Limits) -> Self {
        Self {
            max_keys: limits.reclaim_max_keys as usize,
            min_interval_ms: limits.reclaim_min_interval_ms,
            max_interval_ms: limits.reclaim_max_interval_ms,
            max_age_ms: limits.reclaim_max_age_ms,
        }
    }

    /// Checks that the policy can ever let a key age out.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `max_age_ms` or
    /// `max_interval_ms` is zero, or `max_interval_ms` is below
    /// `min_interval_ms`.
    pub fn validate(&self) -> FlowResult<()> {
        if self.max_age_ms == 0 {
            return Err(FlowError::invalid_config("reclaim: max_age_ms must be positive"));
        }
        if self.max_interval_ms == 0 {
            return Err(FlowError::invalid_config(
                "reclaim: max_interval_ms must be positive",
            ));
        }
        if self.max_interval_ms < self.min_interval_ms {
            return Err(FlowError::invalid_config(format!(
                "reclaim: max_interval_ms ({}) must be >= min_interval_ms ({})",
                self.max_interval_ms, self.min_interval_ms
            )));
        }
        Ok(())
    }

    /// A policy with short intervals for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_keys: 4,
            min_interval_ms: 10,
            max_interval_ms: 100,
            max_age_ms: 50,
        }
    }
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self::from_limits(&Limits::new())
    }
}

const NEVER: u64 = u64::MAX;

/// Decides when an inline sweep is due and lets only one thread run it.
#[derive(Debug)]
pub struct ReclaimTrigger {
    policy: ReclaimPolicy,
    last_sweep_ms: AtomicU64,
    sweeping: Mutex<()>,
}

impl ReclaimTrigger {
    /// Creates a trigger. The interval clock starts at the first check.
    #[must_use]
    pub const fn new(policy: ReclaimPolicy) -> Self {
        Self {
            policy,
            last_sweep_ms: AtomicU64::new(NEVER),
            sweeping: Mutex::new(()),
        }
    }

    /// The policy this trigger applies.
    #[must_use]
    pub const fn policy(&self) -> &ReclaimPolicy {
        &self.policy
    }

    /// Returns whether a sweep is due with `keys` entries at `now_ms`.
    pub fn is_due(&self, keys: usize, now_ms: u64) -> bool {
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if last == NEVER {
            // First look: start the interval clock now.
            let _ = self.last_sweep_ms.compare_exchange(
                NEVER,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return false;
        }
        let elapsed = now_ms.saturating_sub(last);
        (keys > self.policy.max_keys && elapsed >= self.policy.min_interval_ms)
            || elapsed >= self.policy.max_interval_ms
    }

    /// Runs `sweep` if one is due and no other thread is sweeping.
    ///
    /// Returns the number of entries removed, or `None` if no sweep ran.
    pub fn run_if_due(
        &self,
        keys: usize,
        now_ms: u64,
        sweep: impl FnOnce() -> usize,
    ) -> Option<usize> {
        if !self.is_due(keys, now_ms) {
            return None;
        }
        let _guard = self.sweeping.try_lock()?;
        // Another thread may have swept while we checked.
        if !self.is_due(keys, now_ms) {
            return None;
        }
        let removed = sweep();
        self.mark_swept(now_ms);
        Some(removed)
    }

    /// Records a sweep at `now_ms`.
    pub fn mark_swept(&self, now_ms: u64) {
        self.last_sweep_ms.store(now_ms, Ordering::Release);
    }
}

/// Background thread sweeping a pipeline's controllers periodically.
///
/// The thread stops when [`stop`](Self::stop) is called or the handle is
/// dropped.
#[derive(Debug)]
pub struct Reclaimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Starts sweeping `pipeline` every `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(pipeline: Arc<FlowPipeline>, period: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("sluice-reclaimer".to_string())
            .spawn(move || {
                info!(period_ms = period.as_millis(), "reclaimer started");
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            let removed = pipeline.reclaim_now();
                            if removed > 0 {
                                debug!(removed, "periodic reclaim");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("reclaimer stopped");
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_limits() {
        let policy = ReclaimPolicy::default();
        assert_eq!(policy.max_keys, 100);
        assert_eq!(policy.min_interval_ms, 1000);
        assert_eq!(policy.max_interval_ms, 60_000);
        assert_eq!(policy.max_age_ms, 10_000);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReclaimPolicy::default().validate().is_ok());
        assert!(ReclaimPolicy::for_testing().validate().is_ok());

        let never_ages = ReclaimPolicy {
            max_age_ms: 0,
            ..ReclaimPolicy::default()
        };
        assert!(matches!(never_ages.validate(), Err(FlowError::InvalidConfig { .. })));

        let every_request = ReclaimPolicy {
            max_interval_ms: 0,
            min_interval_ms: 0,
            ..ReclaimPolicy::default()
        };
        assert!(every_request.validate().is_err());

        let inverted = ReclaimPolicy {
            min_interval_ms: 60_000,
            max_interval_ms: 1_000,
            ..ReclaimPolicy::default()
        };
        let err = inverted.validate().unwrap_err();
        assert!(err.to_string().contains("min_interval_ms"));
    }

    #[test]
    fn test_first_check_starts_clock() {
        let trigger = ReclaimTrigger::new(ReclaimPolicy::for_testing());
        assert!(!trigger.is_due(1000, 5_000));
        assert!(!trigger.is_due(1000, 5_005));
        assert!(trigger.is_due(1000, 5_010));
    }

    #[test]
    fn test_key_count_and_interval_triggers() {
        let trigger = ReclaimTrigger::new(ReclaimPolicy::for_testing());
        assert!(!trigger.is_due(0, 0));
        // Few keys: only the max interval triggers.
        assert!(!trigger.is_due(2, 50));
        assert!(trigger.is_due(2, 100));
        // Many keys: the min interval is enough.
        assert!(trigger.is_due(5, 10));
    }

    #[test]
    fn test_run_if_due_resets_interval() {
        let trigger = ReclaimTrigger::new(ReclaimPolicy::for_testing());
        assert_eq!(trigger.run_if_due(10, 0, || 1), None);
        assert_eq!(trigger.run_if_due(10, 20, || 3), Some(3));
        assert_eq!(trigger.run_if_due(10, 25, || 3), None);
        assert_eq!(trigger.run_if_due(10, 30, || 2), Some(2));
    }

    #[test]
    fn test_policy_toml_defaults() {
        let policy: ReclaimPolicy = toml::from_str("max_keys = 7").unwrap();
        assert_eq!(policy.max_keys, 7);
        assert_eq!(policy.max_age_ms, 10_000);
    }
}

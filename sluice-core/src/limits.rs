//! System limits and configuration bounds.
//!
//! Every queue and per-key map has an explicit bound. Per-key state that the
//! controllers create lazily is reclaimed once idle, so the maps stay bounded
//! even when keys come from volatile identifiers such as minted cookies.

/// Name of the cookie used to partition anonymous clients.
pub const DEFAULT_COOKIE_NAME: &str = "GS_FLOW_CONTROL";

/// Default request timeout for the whole controller walk (60 seconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Milliseconds in one day; used to rank rate controllers by strictness.
pub const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// System-wide limits for the flow-control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Admission.
    /// Default timeout for one request's admission walk, in milliseconds.
    /// Zero means "wait forever".
    pub default_timeout_ms: u64,
    /// Largest capacity a concurrency controller may be configured with.
    pub max_capacity: u32,

    // Reclamation of per-key state.
    /// Key count above which an inline sweep becomes eligible.
    pub reclaim_max_keys: u32,
    /// Minimum interval between two key-count-triggered sweeps.
    pub reclaim_min_interval_ms: u64,
    /// Maximum interval between two sweeps regardless of key count.
    pub reclaim_max_interval_ms: u64,
    /// Idle age after which an empty per-key entry is removed.
    pub reclaim_max_age_ms: u64,

    // Cookies.
    /// Max-age attached to minted partition cookies, in seconds.
    pub cookie_max_age_secs: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Admission: 60s walk, capacities up to 64k.
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_capacity: 65_536,

            // Reclaim: at most 100 idle keys, sweep at most once a second,
            // at least once a minute, idle after 10s.
            reclaim_max_keys: 100,
            reclaim_min_interval_ms: 1000,
            reclaim_max_interval_ms: 60_000,
            reclaim_max_age_ms: 10_000,

            // Cookies: one day.
            cookie_max_age_secs: 24 * 60 * 60,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_capacity == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_capacity",
                reason: "must be positive",
            });
        }

        if self.reclaim_max_age_ms == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "reclaim_max_age_ms",
                reason: "must be positive",
            });
        }

        if self.reclaim_max_interval_ms < self.reclaim_min_interval_ms {
            return Err(crate::Error::InvalidArgument {
                name: "reclaim_max_interval_ms",
                reason: "must be >= reclaim_min_interval_ms",
            });
        }

        Ok(())
    }

    /// Checks a configured capacity against `max_capacity`.
    ///
    /// # Errors
    /// Returns an error if `capacity` is zero or above the maximum.
    pub fn check_capacity(&self, capacity: u32) -> crate::Result<()> {
        if capacity == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "capacity",
                reason: "must be positive",
            });
        }
        if capacity > self.max_capacity {
            return Err(crate::Error::LimitExceeded {
                limit: "max_capacity",
                max: u64::from(self.max_capacity),
                actual: u64::from(capacity),
            });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-key rate controller.
//!
//! Counts matching requests per key in fixed windows of `window_ms`. Once a
//! key goes over `limit` in the current window its requests are either
//! rejected outright or delayed, depending on configuration. Every matched
//! request gets the `X-Rate-Limit-*` headers describing the limit, whatever
//! the outcome.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use sluice_core::{Clock, PartitionKey, Request, SystemClock, MILLIS_PER_DAY};
use tracing::debug;

use crate::controller::{ControllerStats, FlowController, StatsCounters, Ticket};
use crate::error::{FlowError, FlowResult};
use crate::key::{IpKeyGenerator, KeyGenerator};
use crate::matcher::{AnyRequest, RequestMatcher};
use crate::reclaim::{ReclaimPolicy, ReclaimTrigger};

/// Header naming the requests the limit applies to.
pub const HEADER_CONTEXT: &str = "X-Rate-Limit-Context";
/// Header carrying the per-window limit.
pub const HEADER_LIMIT: &str = "X-Rate-Limit-Limit";
/// Header carrying the requests left in the window.
pub const HEADER_REMAINING: &str = "X-Rate-Limit-Remaining";
/// Header carrying the next window start, in epoch seconds.
pub const HEADER_RESET: &str = "X-Rate-Limit-Reset";
/// Header describing what happens to excess requests.
pub const HEADER_ACTION: &str = "X-Rate-Limit-Action";

/// Request count of one key in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RateCounter {
    period: u64,
    count: u64,
    last_access_ms: u64,
}

impl RateCounter {
    const fn new(period: u64, now_ms: u64) -> Self {
        Self {
            period,
            count: 0,
            last_access_ms: now_ms,
        }
    }

    /// Counts one request in `period`, resetting on rollover. Returns the
    /// count including this request.
    fn hit(&mut self, period: u64, now_ms: u64) -> u64 {
        if period != self.period {
            self.period = period;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.last_access_ms = now_ms;
        self.count
    }

    const fn is_idle(&self, current_period: u64, now_ms: u64, max_age_ms: u64) -> bool {
        self.period < current_period && now_ms.saturating_sub(self.last_access_ms) >= max_age_ms
    }
}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Requests left in the window; negative once over the limit.
    pub residual: i64,
    /// Start of the next window, epoch milliseconds.
    pub reset_at_ms: u64,
}

/// Limits each key to `limit` requests per `window_ms`.
#[derive(Debug)]
pub struct RateFlowController {
    name: String,
    named: bool,
    matcher: Box<dyn RequestMatcher>,
    keys: Box<dyn KeyGenerator>,
    limit: u64,
    window_ms: u64,
    delay: Option<Duration>,
    windows: DashMap<PartitionKey, RateCounter>,
    clock: Arc<dyn Clock>,
    reclaim: ReclaimTrigger,
    counters: StatsCounters,
}

impl RateFlowController {
    /// Creates a controller allowing `limit` requests per `window_ms` for
    /// each client IP.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `limit` or `window_ms` is zero.
    pub fn new(limit: u64, window_ms: u64) -> FlowResult<Self> {
        if limit == 0 {
            return Err(FlowError::invalid_config("rate controller: limit must be positive"));
        }
        if window_ms == 0 {
            return Err(FlowError::invalid_config("rate controller: window must be positive"));
        }
        let mut controller = Self {
            name: String::new(),
            named: false,
            matcher: Box::new(AnyRequest),
            keys: Box::new(IpKeyGenerator),
            limit,
            window_ms,
            delay: None,
            windows: DashMap::new(),
            clock: Arc::new(SystemClock),
            reclaim: ReclaimTrigger::new(ReclaimPolicy::default()),
            counters: StatsCounters::new(),
        };
        controller.rename();
        Ok(controller)
    }

    /// Restricts the controller to the requests selected by `matcher`.
    #[must_use]
    pub fn with_matcher(mut self, matcher: Box<dyn RequestMatcher>) -> Self {
        self.matcher = matcher;
        self.rename();
        self
    }

    /// Partitions requests with `keys` instead of by client IP.
    #[must_use]
    pub fn with_keys(mut self, keys: Box<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    /// Delays excess requests by `delay` instead of rejecting them.
    /// A zero delay means reject.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self.rename();
        self
    }

    /// Replaces the generated name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.named = true;
        self
    }

    /// Uses `clock` for windows and reset times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the reclamation policy.
    #[must_use]
    pub fn with_reclaim(mut self, policy: ReclaimPolicy) -> Self {
        self.reclaim = ReclaimTrigger::new(policy);
        self
    }

    fn rename(&mut self) {
        if self.named {
            return;
        }
        self.name = match self.delay {
            None => format!("rate[{}]={}/{}ms", self.matcher, self.limit, self.window_ms),
            Some(delay) => format!(
                "rate[{}]={}/{}ms;delay={}ms",
                self.matcher,
                self.limit,
                self.window_ms,
                delay.as_millis()
            ),
        };
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Counts one request for `key` at `now_ms`.
    pub fn record(&self, key: &PartitionKey, now_ms: u64) -> RateDecision {
        let period = now_ms / self.window_ms;
        let count = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| RateCounter::new(period, now_ms))
            .hit(period, now_ms);
        let limit = i64::try_from(self.limit).unwrap_or(i64::MAX);
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        RateDecision {
            residual: limit - count,
            reset_at_ms: period.saturating_add(1).saturating_mul(self.window_ms),
        }
    }

    fn action(&self) -> String {
        match self.delay {
            None => "Reject excess requests".to_string(),
            Some(delay) => format!("Delay excess requests {}ms", delay.as_millis()),
        }
    }

    fn publish(&self, request: &mut dyn Request, decision: RateDecision) {
        let context = self.matcher.to_string();
        let remaining = decision.residual.max(0);
        let action = self.action();
        let response = request.response_mut();
        response.add_header(HEADER_CONTEXT, context);
        response.add_header(HEADER_LIMIT, self.limit.to_string());
        response.add_header(HEADER_REMAINING, remaining.to_string());
        response.add_header(HEADER_RESET, (decision.reset_at_ms / 1000).to_string());
        response.add_header(HEADER_ACTION, action);
    }

    fn sweep(&self, now_ms: u64) -> usize {
        let current = now_ms / self.window_ms;
        let max_age_ms = self.reclaim.policy().max_age_ms;
        let before = self.windows.len();
        self.windows
            .retain(|_, counter| !counter.is_idle(current, now_ms, max_age_ms));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(controller = %self.name, removed, "reclaimed idle rate counters");
        }
        removed
    }
}

impl FlowController for RateFlowController {
    fn name(&self) -> &str {
        &self.name
    }

    /// Rate controllers run before every concurrency controller, stricter
    /// limits first.
    fn priority(&self) -> i64 {
        let per_day = self.limit.saturating_mul(MILLIS_PER_DAY) / self.window_ms;
        i64::MIN + i64::try_from(per_day).unwrap_or(i64::MAX)
    }

    fn try_admit(
        &self,
        request: &mut dyn Request,
        timeout: Option<Duration>,
        _ticket: &mut Ticket,
    ) -> FlowResult<bool> {
        if !self.matcher.matches(request) {
            return Ok(true);
        }

        let key = self.keys.key_for(request);
        let now_ms = self.clock.now_ms();
        let decision = self.record(&key, now_ms);
        self.reclaim
            .run_if_due(self.windows.len(), now_ms, || self.sweep(now_ms));
        self.publish(request, decision);

        debug!(
            controller = %self.name,
            request = %request.id(),
            key = %key,
            residual = decision.residual,
            "rate decision"
        );

        if decision.residual >= 0 {
            self.counters.admitted();
            return Ok(true);
        }
        match self.delay {
            None => {
                self.counters.rejected();
                Err(FlowError::TooManyRequests {
                    context: self.matcher.to_string(),
                    limit: self.limit,
                    reset_at_ms: decision.reset_at_ms,
                })
            }
            Some(delay) if timeout.is_some_and(|budget| delay > budget) => {
                // No point waiting part of the delay.
                self.counters.timed_out();
                Ok(false)
            }
            Some(delay) => {
                thread::sleep(delay);
                self.counters.admitted();
                Ok(true)
            }
        }
    }

    fn on_complete(&self, _ticket: Ticket) {}

    fn stats(&self) -> ControllerStats {
        let mut stats = ControllerStats {
            name: self.name.clone(),
            priority: self.priority(),
            capacity: self.limit,
            keys: self.windows.len(),
            ..ControllerStats::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    fn reclaim(&self, now_ms: u64) -> usize {
        let removed = self.sweep(now_ms);
        self.reclaim.mark_swept(now_ms);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::OwsRequestMatcher;
    use sluice_core::{HttpRequest, ManualClock};
    use std::net::IpAddr;

    const CLIENT: &str = "10.0.0.1";

    fn request() -> HttpRequest {
        HttpRequest::new().with_remote_addr(CLIENT.parse::<IpAddr>().unwrap())
    }

    fn admit(
        c: &RateFlowController,
        req: &mut HttpRequest,
        timeout: Option<Duration>,
    ) -> FlowResult<bool> {
        let mut ticket = Ticket::new(req.id());
        let outcome = c.try_admit(req, timeout, &mut ticket);
        c.on_complete(ticket);
        outcome
    }

    fn clocked(limit: u64, window_ms: u64, clock: &Arc<ManualClock>) -> RateFlowController {
        RateFlowController::new(limit, window_ms)
            .unwrap()
            .with_clock(Arc::clone(clock) as Arc<dyn Clock>)
    }

    #[test]
    fn test_window_reset() {
        let clock = Arc::new(ManualClock::new(0));
        let c = clocked(2, 1000, &clock);
        let key = PartitionKey::new(CLIENT);

        assert_eq!(c.record(&key, 0).residual, 1);
        assert_eq!(c.record(&key, 100).residual, 0);
        assert_eq!(c.record(&key, 200).residual, -1);
        let next = c.record(&key, 1100);
        assert_eq!(next.residual, 1);
        assert_eq!(next.reset_at_ms, 2000);
    }

    #[test]
    fn test_reject_over_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let c = clocked(2, 1000, &clock);

        assert!(admit(&c, &mut request(), None).unwrap());
        clock.set(100);
        assert!(admit(&c, &mut request(), None).unwrap());
        clock.set(200);
        let err = admit(&c, &mut request(), None).unwrap_err();
        assert!(matches!(
            err,
            FlowError::TooManyRequests { limit: 2, reset_at_ms: 1000, .. }
        ));
        assert_eq!(err.status_code(), 429);

        clock.set(1100);
        assert!(admit(&c, &mut request(), None).unwrap());
    }

    #[test]
    fn test_headers_always_published() {
        let clock = Arc::new(ManualClock::new(5_000));
        let matcher = OwsRequestMatcher::operation("WMS", "GetMap").unwrap();
        let c = clocked(1, 60_000, &clock).with_matcher(Box::new(matcher));
        let getmap = || request().with_service("WMS").with_operation("GetMap");

        let mut first = getmap();
        assert!(admit(&c, &mut first, None).unwrap());
        let r = first.response();
        assert_eq!(r.header(HEADER_CONTEXT), Some("wms.getmap"));
        assert_eq!(r.header(HEADER_LIMIT), Some("1"));
        assert_eq!(r.header(HEADER_REMAINING), Some("0"));
        assert_eq!(r.header(HEADER_RESET), Some("60"));
        assert_eq!(r.header(HEADER_ACTION), Some("Reject excess requests"));

        let mut second = getmap();
        assert!(admit(&c, &mut second, None).is_err());
        assert_eq!(second.response().header(HEADER_REMAINING), Some("0"));

        let mut other = request().with_service("WFS");
        assert!(admit(&c, &mut other, None).unwrap());
        assert!(other.response().header(HEADER_LIMIT).is_none());
    }

    #[test]
    fn test_delay_admits_after_sleep() {
        let clock = Arc::new(ManualClock::new(0));
        let c = clocked(1, 60_000, &clock).with_delay(Duration::from_millis(20));
        assert!(admit(&c, &mut request(), None).unwrap());

        let mut late = request();
        let started = std::time::Instant::now();
        assert!(admit(&c, &mut late, Some(Duration::from_secs(1))).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(
            late.response().header(HEADER_ACTION),
            Some("Delay excess requests 20ms")
        );
    }

    #[test]
    fn test_delay_beyond_timeout_is_refused_without_sleeping() {
        let clock = Arc::new(ManualClock::new(0));
        let c = clocked(1, 60_000, &clock).with_delay(Duration::from_secs(30));
        assert!(admit(&c, &mut request(), None).unwrap());

        let started = std::time::Instant::now();
        assert!(!admit(&c, &mut request(), Some(Duration::from_millis(100))).unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(c.stats().timed_out, 1);
    }

    #[test]
    fn test_stricter_limit_sorts_first() {
        let strict = RateFlowController::new(10, 60_000).unwrap();
        let loose = RateFlowController::new(1000, 60_000).unwrap();
        assert!(strict.priority() < loose.priority());
        assert!(loose.priority() < 0);
    }

    #[test]
    fn test_reclaim_keeps_current_window() {
        let clock = Arc::new(ManualClock::new(0));
        let c = clocked(5, 1000, &clock).with_reclaim(ReclaimPolicy::for_testing());
        c.record(&PartitionKey::new("a"), 0);
        c.record(&PartitionKey::new("b"), 990);

        assert_eq!(FlowController::reclaim(&c, 999), 0);
        assert_eq!(FlowController::reclaim(&c, 1020), 1);
        assert_eq!(c.key_count(), 1);
        assert_eq!(FlowController::reclaim(&c, 1040), 1);
        assert_eq!(c.key_count(), 0);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(matches!(
            RateFlowController::new(1, 0),
            Err(FlowError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_explicit_name_survives_later_builders() {
        let c = RateFlowController::new(10, 1000)
            .unwrap()
            .with_name("tight")
            .with_matcher(Box::new(OwsRequestMatcher::service("wfs").unwrap()))
            .with_delay(Duration::from_millis(5));
        assert_eq!(c.name(), "tight");

        let mut r = request().with_service("wfs");
        assert!(admit(&c, &mut r, None).unwrap());
        assert_eq!(r.response().header(HEADER_CONTEXT), Some("wfs"));
    }
}

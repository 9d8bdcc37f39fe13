//! Per-key concurrency controllers.
//!
//! Every partition key (client IP, cookie, user) gets its own blocker, created
//! the first time the key is seen and reclaimed once idle. The key map is a
//! `DashMap`: creating a key's queue and pinning it happen under the shard
//! lock of that key, so two threads seeing a new key at once agree on one
//! queue, and a sweep (which takes the same shard locks) never removes a queue
//! between lookup and use.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sluice_core::{Clock, PartitionKey, Request, SystemClock};
use tracing::{debug, warn};

use crate::blocker::{new_blocker, ThreadBlocker};
use crate::controller::{settle_wait, ControllerStats, FlowController, StatsCounters, Ticket};
use crate::error::{FlowError, FlowResult};
use crate::key::{CookieKeyGenerator, IpKeyGenerator, KeyGenerator};
use crate::matcher::{AnyRequest, RequestMatcher};
use crate::priority::PriorityProvider;
use crate::reclaim::{ReclaimPolicy, ReclaimTrigger};

/// Blocker and bookkeeping for one key.
struct KeyQueue {
    blocker: Box<dyn ThreadBlocker>,
    /// Requests between lookup and completion.
    in_use: AtomicUsize,
    last_modified_ms: AtomicU64,
}

impl KeyQueue {
    fn new(blocker: Box<dyn ThreadBlocker>, now_ms: u64) -> Self {
        Self {
            blocker,
            in_use: AtomicUsize::new(0),
            last_modified_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_modified_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    fn pin(&self, now_ms: u64) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
        self.touch(now_ms);
    }

    fn unpin(&self) {
        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "key queue unpinned more often than pinned");
    }

    fn is_idle(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.in_use.load(Ordering::Acquire) == 0
            && self.blocker.running_count() == 0
            && self.blocker.queued_count() == 0
            && now_ms.saturating_sub(self.last_modified_ms.load(Ordering::Acquire)) >= max_age_ms
    }
}

impl fmt::Debug for KeyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyQueue")
            .field("running", &self.blocker.running_count())
            .field("queued", &self.blocker.queued_count())
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .field("last_modified_ms", &self.last_modified_ms.load(Ordering::Relaxed))
            .finish()
    }
}

/// Caps the concurrently running requests of each partition key.
#[derive(Debug)]
pub struct KeyedFlowController {
    name: String,
    capacity: usize,
    matcher: Box<dyn RequestMatcher>,
    keys: Box<dyn KeyGenerator>,
    priority: Option<Arc<dyn PriorityProvider>>,
    queues: DashMap<PartitionKey, Arc<KeyQueue>>,
    clock: Arc<dyn Clock>,
    reclaim: ReclaimTrigger,
    counters: StatsCounters,
    peak_running: AtomicUsize,
    closed: AtomicBool,
}

impl KeyedFlowController {
    /// Creates a controller keyed by `keys`, allowing `capacity` concurrent
    /// requests per key.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `capacity` is zero.
    pub fn new(kind: &str, keys: Box<dyn KeyGenerator>, capacity: usize) -> FlowResult<Self> {
        if capacity == 0 {
            return Err(FlowError::invalid_config(format!(
                "{kind} concurrency controller: capacity must be positive"
            )));
        }
        Ok(Self {
            name: format!("{kind}={capacity}"),
            capacity,
            matcher: Box::new(AnyRequest),
            keys,
            priority: None,
            queues: DashMap::new(),
            clock: Arc::new(SystemClock),
            reclaim: ReclaimTrigger::new(ReclaimPolicy::default()),
            counters: StatsCounters::new(),
            peak_running: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Per-client controller keyed by the partition cookie.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `capacity` is zero.
    pub fn per_cookie(capacity: usize, keys: CookieKeyGenerator) -> FlowResult<Self> {
        Self::new("user", Box::new(keys), capacity)
    }

    /// Per-client controller keyed by client IP.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `capacity` is zero.
    pub fn per_ip(capacity: usize) -> FlowResult<Self> {
        Self::new("ip", Box::new(IpKeyGenerator), capacity)
    }

    /// Restricts the controller to the requests selected by `matcher`.
    #[must_use]
    pub fn with_matcher(mut self, matcher: Box<dyn RequestMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Orders each key's waiters by `provider`.
    #[must_use]
    pub fn with_priority(mut self, provider: Arc<dyn PriorityProvider>) -> Self {
        self.priority = Some(provider);
        self
    }

    /// Uses `clock` for idle ages and sweep intervals.
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

    /// Replaces the generated name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of requests running for `key`.
    #[must_use]
    pub fn running_for(&self, key: &str) -> usize {
        self.queues
            .get(key)
            .map_or(0, |queue| queue.blocker.running_count())
    }

    /// Looks up or creates the queue for `key` and pins it.
    ///
    /// The returned queue cannot be reclaimed until it is unpinned.
    fn pin_queue(&self, key: &PartitionKey, now_ms: u64) -> Arc<KeyQueue> {
        let entry = self.queues.entry(key.clone()).or_insert_with(|| {
            debug!(controller = %self.name, key = %key, "new key queue");
            Arc::new(KeyQueue::new(
                new_blocker(self.capacity, self.priority.as_ref()),
                now_ms,
            ))
        });
        entry.pin(now_ms);
        Arc::clone(entry.value())
    }

    fn sweep(&self, now_ms: u64) -> usize {
        let max_age_ms = self.reclaim.policy().max_age_ms;
        let before = self.queues.len();
        let mut removed = 0;
        self.queues.retain(|_, queue| {
            let idle = queue.is_idle(now_ms, max_age_ms);
            if idle {
                removed += 1;
            }
            !idle
        });
        if removed > 0 {
            debug!(controller = %self.name, removed, before, "reclaimed idle keys");
        }
        removed
    }
}

impl FlowController for KeyedFlowController {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i64 {
        i64::try_from(self.capacity).unwrap_or(i64::MAX)
    }

    fn try_admit(
        &self,
        request: &mut dyn Request,
        timeout: Option<Duration>,
        ticket: &mut Ticket,
    ) -> FlowResult<bool> {
        if !self.matcher.matches(request) {
            return Ok(true);
        }
        if self.closed.load(Ordering::Acquire) {
            warn!(
                controller = %self.name,
                request = %request.id(),
                "controller closed, request not admitted"
            );
            self.counters.rejected();
            return Ok(false);
        }

        let key = self.keys.key_for(request);
        let now_ms = self.clock.now_ms();
        let queue = self.pin_queue(&key, now_ms);
        ticket.set_key(key.clone());
        ticket.mark_pinned();
        // A key first seen while close() ran may have missed it.
        if self.closed.load(Ordering::SeqCst) {
            queue.blocker.close();
        }

        self.reclaim
            .run_if_due(self.queues.len(), now_ms, || self.sweep(now_ms));

        let outcome = queue.blocker.admit(request, timeout);
        let admitted = settle_wait(&self.name, request.id(), outcome, &self.counters);
        if admitted {
            ticket.mark_slot();
            self.peak_running
                .fetch_max(queue.blocker.running_count(), Ordering::AcqRel);
        }
        queue.touch(self.clock.now_ms());
        debug!(
            controller = %self.name,
            request = %request.id(),
            key = %key,
            admitted,
            running = queue.blocker.running_count(),
            "keyed concurrency decision"
        );
        Ok(admitted)
    }

    fn on_complete(&self, ticket: Ticket) {
        let Some(key) = ticket.key() else {
            return;
        };
        let Some(queue) = self.queues.get(key).map(|q| Arc::clone(q.value())) else {
            // Pinned queues are never reclaimed, so this is a bookkeeping bug.
            warn!(controller = %self.name, key = %key, "completion for unknown key");
            return;
        };
        if ticket.holds_slot() {
            queue.blocker.release(ticket.request_id());
        }
        queue.touch(self.clock.now_ms());
        if ticket.is_pinned() {
            queue.unpin();
        }
    }

    fn stats(&self) -> ControllerStats {
        let (running, queued) = self.queues.iter().fold((0, 0), |(r, q), entry| {
            (
                r + entry.blocker.running_count(),
                q + entry.blocker.queued_count(),
            )
        });
        let mut stats = ControllerStats {
            name: self.name.clone(),
            priority: self.priority(),
            capacity: self.capacity as u64,
            running,
            queued,
            peak_running: self.peak_running.load(Ordering::Acquire),
            keys: self.queues.len(),
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

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in &self.queues {
            entry.blocker.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{HttpRequest, ManualClock, DEFAULT_COOKIE_NAME};
    use std::net::IpAddr;

    fn from(addr: &str) -> HttpRequest {
        HttpRequest::new().with_remote_addr(addr.parse::<IpAddr>().unwrap())
    }

    fn admit(c: &KeyedFlowController, req: &mut HttpRequest, timeout_ms: u64) -> (bool, Ticket) {
        let mut ticket = Ticket::new(req.id());
        let ok = c
            .try_admit(req, Some(Duration::from_millis(timeout_ms)), &mut ticket)
            .unwrap();
        (ok, ticket)
    }

    fn controller(clock: &Arc<ManualClock>) -> KeyedFlowController {
        KeyedFlowController::per_ip(1)
            .unwrap()
            .with_clock(Arc::clone(clock) as Arc<dyn Clock>)
            .with_reclaim(ReclaimPolicy::for_testing())
    }

    #[test]
    fn test_keys_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let c = controller(&clock);

        let (ok, a1) = admit(&c, &mut from("10.0.0.1"), 10);
        assert!(ok);
        let (ok, a2) = admit(&c, &mut from("10.0.0.1"), 10);
        assert!(!ok);
        let (ok, b1) = admit(&c, &mut from("10.0.0.2"), 10);
        assert!(ok);
        assert_eq!(c.key_count(), 2);
        assert_eq!(c.running_for("10.0.0.1"), 1);

        for t in [a2, a1, b1] {
            c.on_complete(t);
        }
        assert_eq!(c.running_for("10.0.0.1"), 0);
        assert_eq!(c.stats().running, 0);
    }

    #[test]
    fn test_timed_out_completion_does_not_release() {
        let clock = Arc::new(ManualClock::new(0));
        let c = controller(&clock);
        let (_, held) = admit(&c, &mut from("10.0.0.1"), 10);
        let (ok, late) = admit(&c, &mut from("10.0.0.1"), 10);
        assert!(!ok);
        assert!(late.is_pinned());
        assert!(!late.holds_slot());

        c.on_complete(late);
        assert_eq!(c.running_for("10.0.0.1"), 1);
        c.on_complete(held);
        assert_eq!(c.running_for("10.0.0.1"), 0);
    }

    #[test]
    fn test_reclaim_removes_only_idle_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let c = controller(&clock);

        let (_, idle) = admit(&c, &mut from("10.0.0.1"), 10);
        let (_, busy) = admit(&c, &mut from("10.0.0.2"), 10);
        c.on_complete(idle);

        clock.set(1_000);
        assert_eq!(FlowController::reclaim(&c, clock.now_ms()), 1);
        assert_eq!(c.key_count(), 1);
        assert_eq!(c.running_for("10.0.0.2"), 1);

        c.on_complete(busy);
        assert_eq!(FlowController::reclaim(&c, clock.now_ms()), 0);
        clock.advance(50);
        assert_eq!(FlowController::reclaim(&c, clock.now_ms()), 1);
        assert_eq!(c.key_count(), 0);
    }

    #[test]
    fn test_inline_sweep_bounds_key_count() {
        let clock = Arc::new(ManualClock::new(0));
        let c = controller(&clock);

        for i in 0..10 {
            let (ok, t) = admit(&c, &mut from(&format!("10.0.1.{i}")), 10);
            assert!(ok);
            c.on_complete(t);
        }
        assert_eq!(c.key_count(), 10);

        // Past the idle age and the minimum interval: the next admission
        // sweeps the ten idle keys away.
        clock.advance(100);
        let (_, t) = admit(&c, &mut from("10.0.2.1"), 10);
        assert_eq!(c.key_count(), 1);
        c.on_complete(t);
    }

    #[test]
    fn test_cookie_keyed_controller_sets_cookie() {
        let c = KeyedFlowController::per_cookie(2, CookieKeyGenerator::default()).unwrap();
        let mut req = HttpRequest::new();
        let (ok, t) = admit(&c, &mut req, 10);
        assert!(ok);
        assert!(req.response().cookie(DEFAULT_COOKIE_NAME).is_some());
        assert_eq!(c.name(), "user=2");
        c.on_complete(t);
    }

    /// Closes its controller while deriving the key, so the key's queue is
    /// created after `close` has walked the existing ones.
    #[derive(Debug, Default)]
    struct ClosingKeys {
        controller: std::sync::OnceLock<std::sync::Weak<KeyedFlowController>>,
    }

    impl KeyGenerator for Arc<ClosingKeys> {
        fn key_for(&self, request: &mut dyn Request) -> PartitionKey {
            if let Some(controller) = self.controller.get().and_then(std::sync::Weak::upgrade) {
                controller.close();
            }
            IpKeyGenerator.key_for(request)
        }
    }

    #[test]
    fn test_key_created_during_close_is_refused() {
        let keys = Arc::new(ClosingKeys::default());
        let generator: Box<dyn KeyGenerator> = Box::new(Arc::clone(&keys));
        let c = Arc::new(KeyedFlowController::new("ip", generator, 1).unwrap());
        keys.controller.set(Arc::downgrade(&c)).unwrap();

        let (ok, t) = admit(&c, &mut from("10.0.0.9"), 10);
        assert!(!ok);
        assert!(!t.holds_slot());
        c.on_complete(t);
        assert_eq!(c.running_for("10.0.0.9"), 0);
        assert_eq!(c.stats().rejected, 1);
    }

    #[test]
    fn test_closed_controller_refuses() {
        let c = KeyedFlowController::per_ip(1).unwrap();
        c.close();
        let (ok, t) = admit(&c, &mut from("10.0.0.1"), 10);
        assert!(!ok);
        c.on_complete(t);
        assert_eq!(c.stats().rejected, 1);
    }
}

//! Thread blockers.
//!
//! A blocker admits at most `capacity` requests at a time and parks the
//! calling thread of every other request until a slot frees up or its timeout
//! expires. Slots are handed off directly: a release pops the next waiter,
//! marks its token admitted and counts it as running before waking it, all
//! under the blocker lock. A waiter therefore never has to compete again for
//! the slot it was given.
//!
//! Each waiter owns a [`WaitToken`] that moves through a small state machine,
//! always under the blocker lock:
//!
//! ```text
//!            release pops token
//!   Queued ──────────────────────▶ Admitted
//!     │                               │
//!     │ deadline, still queued        │ deadline hit before the waiter
//!     ▼                               ▼ observed the handoff
//!   TimedOut                    TimedOutAdmitted (slot released again)
//!
//!   Queued ── close() ──▶ Interrupted
//! ```
//!
//! Exactly one of the timeout path and the release path moves a token out of
//! `Queued`, so a slot can never be both free and occupied.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sluice_core::{Request, RequestId};
use tracing::{debug, trace};

use crate::error::{FlowError, FlowResult};
use crate::priority::PriorityProvider;

/// Blocks calling threads until a slot is free.
pub trait ThreadBlocker: Send + Sync + fmt::Debug {
    /// Waits for a slot for `request`.
    ///
    /// `None` waits forever. Returns `Ok(false)` if the timeout expired.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::Interrupted` if the blocker is closed while waiting.
    fn admit(&self, request: &dyn Request, timeout: Option<Duration>) -> FlowResult<bool>;

    /// Frees the slot held by `id`, waking the next waiter.
    ///
    /// Returns `false`, and changes nothing, if `id` holds no slot.
    fn release(&self, id: RequestId) -> bool;

    /// Number of requests currently holding a slot.
    fn running_count(&self) -> usize;

    /// Number of requests currently waiting.
    fn queued_count(&self) -> usize;

    /// Highest running count ever observed.
    fn peak_running(&self) -> usize;

    /// Maximum number of concurrently running requests.
    fn capacity(&self) -> usize;

    /// Interrupts every waiter and refuses new admissions.
    fn close(&self);
}

/// Lifecycle of one blocked waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TokenState {
    Queued = 0,
    Admitted = 1,
    TimedOut = 2,
    TimedOutAdmitted = 3,
    Interrupted = 4,
}

impl TokenState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Admitted,
            2 => Self::TimedOut,
            3 => Self::TimedOutAdmitted,
            _ => Self::Interrupted,
        }
    }
}

/// One blocked request.
///
/// The state is only written while holding the owning blocker's lock; it is
/// atomic so the token can be shared between the queue and its waiter.
struct WaitToken {
    id: RequestId,
    state: AtomicU8,
    gate: Condvar,
}

impl WaitToken {
    fn new(id: RequestId) -> Self {
        Self {
            id,
            state: AtomicU8::new(TokenState::Queued as u8),
            gate: Condvar::new(),
        }
    }

    fn state(&self) -> TokenState {
        TokenState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: TokenState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for WaitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitToken")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Queue order: negated priority first, then arrival sequence.
type QueueKey = (i64, u64);

#[derive(Debug, Default)]
struct BlockerState {
    running: HashSet<RequestId>,
    queue: BTreeMap<QueueKey, Arc<WaitToken>>,
    next_seq: u64,
    peak_running: usize,
    closed: bool,
}

/// The shared admission engine behind both blocker flavours.
#[derive(Debug)]
struct BlockerCore {
    capacity: usize,
    state: Mutex<BlockerState>,
}

impl BlockerCore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BlockerState::default()),
        }
    }

    fn admit(&self, id: RequestId, priority: i32, timeout: Option<Duration>) -> FlowResult<bool> {
        // A timeout too large to represent is the same as no timeout.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();

        if state.closed {
            return Err(FlowError::Interrupted);
        }
        if state.running.contains(&id) {
            return Ok(true);
        }
        if state.queue.is_empty() && state.running.len() < self.capacity {
            Self::occupy(self.capacity, &mut state, id);
            return Ok(true);
        }

        let key = (-i64::from(priority), state.next_seq);
        state.next_seq += 1;
        let token = Arc::new(WaitToken::new(id));
        state.queue.insert(key, Arc::clone(&token));
        trace!(request = %id, priority, queued = state.queue.len(), "request queued");

        loop {
            match token.state() {
                TokenState::Admitted => return Ok(true),
                TokenState::Interrupted => return Err(FlowError::Interrupted),
                TokenState::Queued | TokenState::TimedOut | TokenState::TimedOutAdmitted => {}
            }

            match deadline {
                None => token.gate.wait(&mut state),
                Some(deadline) => {
                    if token.gate.wait_until(&mut state, deadline).timed_out() {
                        return self.expire(&mut state, key, &token);
                    }
                }
            }
        }
    }

    /// Resolves a waiter whose deadline passed. Runs under the lock.
    fn expire(
        &self,
        state: &mut BlockerState,
        key: QueueKey,
        token: &WaitToken,
    ) -> FlowResult<bool> {
        match token.state() {
            TokenState::Queued => {
                state.queue.remove(&key);
                token.set(TokenState::TimedOut);
                debug!(request = %token.id, "admission timed out");
                Ok(false)
            }
            TokenState::Admitted => {
                // A release handed us the slot after the deadline fired. We
                // will not use it, so pass it on to the next waiter.
                token.set(TokenState::TimedOutAdmitted);
                Self::vacate(self.capacity, state, token.id);
                debug!(request = %token.id, "admission timed out after handoff, slot passed on");
                Ok(false)
            }
            TokenState::Interrupted => Err(FlowError::Interrupted),
            TokenState::TimedOut | TokenState::TimedOutAdmitted => Ok(false),
        }
    }

    fn occupy(capacity: usize, state: &mut BlockerState, id: RequestId) {
        state.running.insert(id);
        debug_assert!(
            state.running.len() <= capacity,
            "blocker over capacity: {} > {capacity}",
            state.running.len()
        );
        state.peak_running = state.peak_running.max(state.running.len());
    }

    /// Frees `id`'s slot and hands free slots to the best waiters.
    fn vacate(capacity: usize, state: &mut BlockerState, id: RequestId) -> bool {
        if !state.running.remove(&id) {
            return false;
        }
        while state.running.len() < capacity {
            let Some((_, token)) = state.queue.pop_first() else {
                break;
            };
            token.set(TokenState::Admitted);
            Self::occupy(capacity, state, token.id);
            token.gate.notify_one();
        }
        true
    }

    fn release(&self, id: RequestId) -> bool {
        let mut state = self.state.lock();
        Self::vacate(self.capacity, &mut state, id)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let waiters = std::mem::take(&mut state.queue);
        for token in waiters.values() {
            token.set(TokenState::Interrupted);
            token.gate.notify_one();
        }
        if !waiters.is_empty() {
            debug!(interrupted = waiters.len(), "blocker closed");
        }
    }

    fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn peak_running(&self) -> usize {
        self.state.lock().peak_running
    }
}

/// First-come first-served blocker.
///
/// Waiters are admitted strictly in arrival order.
#[derive(Debug)]
pub struct SimpleThreadBlocker {
    core: BlockerCore,
}

impl SimpleThreadBlocker {
    /// Creates a blocker admitting `capacity` concurrent requests.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; controllers validate capacities first.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "blocker capacity must be positive");
        Self {
            core: BlockerCore::new(capacity),
        }
    }
}

impl ThreadBlocker for SimpleThreadBlocker {
    fn admit(&self, request: &dyn Request, timeout: Option<Duration>) -> FlowResult<bool> {
        self.core.admit(request.id(), 0, timeout)
    }

    fn release(&self, id: RequestId) -> bool {
        self.core.release(id)
    }

    fn running_count(&self) -> usize {
        self.core.running_count()
    }

    fn queued_count(&self) -> usize {
        self.core.queued_count()
    }

    fn peak_running(&self) -> usize {
        self.core.peak_running()
    }

    fn capacity(&self) -> usize {
        self.core.capacity
    }

    fn close(&self) {
        self.core.close();
    }
}

/// Priority-ordered blocker.
///
/// Waiters with a higher priority are admitted first; equal priorities are
/// admitted in arrival order.
#[derive(Debug)]
pub struct PriorityThreadBlocker {
    core: BlockerCore,
    provider: Arc<dyn PriorityProvider>,
}

impl PriorityThreadBlocker {
    /// Creates a blocker admitting `capacity` concurrent requests, ordering
    /// waiters by `provider`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; controllers validate capacities first.
    #[must_use]
    pub fn new(capacity: usize, provider: Arc<dyn PriorityProvider>) -> Self {
        assert!(capacity > 0, "blocker capacity must be positive");
        Self {
            core: BlockerCore::new(capacity),
            provider,
        }
    }
}

impl ThreadBlocker for PriorityThreadBlocker {
    fn admit(&self, request: &dyn Request, timeout: Option<Duration>) -> FlowResult<bool> {
        let priority = self.provider.priority_for(request);
        self.core.admit(request.id(), priority, timeout)
    }

    fn release(&self, id: RequestId) -> bool {
        self.core.release(id)
    }

    fn running_count(&self) -> usize {
        self.core.running_count()
    }

    fn queued_count(&self) -> usize {
        self.core.queued_count()
    }

    fn peak_running(&self) -> usize {
        self.core.peak_running()
    }

    fn capacity(&self) -> usize {
        self.core.capacity
    }

    fn close(&self) {
        self.core.close();
    }
}

/// Builds the blocker flavour matching an optional priority provider.
#[must_use]
pub fn new_blocker(
    capacity: usize,
    provider: Option<&Arc<dyn PriorityProvider>>,
) -> Box<dyn ThreadBlocker> {
    match provider {
        Some(provider) => Box::new(PriorityThreadBlocker::new(capacity, Arc::clone(provider))),
        None => Box::new(SimpleThreadBlocker::new(capacity)),
    }
}

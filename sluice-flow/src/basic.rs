//! Shared-queue concurrency controllers.
//!
//! One blocker serves every matching request: the global controller matches
//! everything, the category controller matches an OWS service, operation and
//! output format, and the single-IP controller matches one client address.

use std::sync::Arc;
use std::time::Duration;

use sluice_core::Request;
use tracing::debug;

use crate::blocker::{new_blocker, ThreadBlocker};
use crate::controller::{settle_wait, ControllerStats, FlowController, StatsCounters, Ticket};
use crate::error::{FlowError, FlowResult};
use crate::matcher::{AnyRequest, RequestMatcher, SingleIpMatcher};
use crate::priority::PriorityProvider;

/// Caps the number of concurrently running matching requests.
#[derive(Debug)]
pub struct BasicFlowController {
    name: String,
    capacity: usize,
    matcher: Box<dyn RequestMatcher>,
    blocker: Box<dyn ThreadBlocker>,
    counters: StatsCounters,
}

impl BasicFlowController {
    /// Controller over all requests.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `capacity` is zero.
    pub fn global(
        capacity: usize,
        priority: Option<Arc<dyn PriorityProvider>>,
    ) -> FlowResult<Self> {
        Self::for_requests(Box::new(AnyRequest), capacity, priority)
    }

    /// Controller over requests from one client address; all other traffic
    /// passes through.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `capacity` is zero.
    pub fn single_ip(
        ip: SingleIpMatcher,
        capacity: usize,
        priority: Option<Arc<dyn PriorityProvider>>,
    ) -> FlowResult<Self> {
        Self::for_requests(Box::new(ip), capacity, priority)
    }

    /// Controller over the requests selected by `matcher`.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `capacity` is zero.
    pub fn for_requests(
        matcher: Box<dyn RequestMatcher>,
        capacity: usize,
        priority: Option<Arc<dyn PriorityProvider>>,
    ) -> FlowResult<Self> {
        if capacity == 0 {
            return Err(FlowError::invalid_config(format!(
                "concurrency controller for {matcher}: capacity must be positive"
            )));
        }
        let name = format!("{matcher}={capacity}");
        Ok(Self {
            name,
            capacity,
            blocker: new_blocker(capacity, priority.as_ref()),
            matcher,
            counters: StatsCounters::new(),
        })
    }

    /// Replaces the generated name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of requests currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.blocker.running_count()
    }
}

impl FlowController for BasicFlowController {
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
        let outcome = self.blocker.admit(request, timeout);
        let admitted = settle_wait(&self.name, request.id(), outcome, &self.counters);
        if admitted {
            ticket.mark_slot();
        }
        debug!(
            controller = %self.name,
            request = %request.id(),
            admitted,
            running = self.blocker.running_count(),
            "concurrency decision"
        );
        Ok(admitted)
    }

    fn on_complete(&self, ticket: Ticket) {
        if ticket.holds_slot() {
            self.blocker.release(ticket.request_id());
        }
    }

    fn stats(&self) -> ControllerStats {
        let mut stats = ControllerStats {
            name: self.name.clone(),
            priority: self.priority(),
            capacity: self.capacity as u64,
            running: self.blocker.running_count(),
            queued: self.blocker.queued_count(),
            peak_running: self.blocker.peak_running(),
            keys: 0,
            ..ControllerStats::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    fn close(&self) {
        self.blocker.close();
    }
}

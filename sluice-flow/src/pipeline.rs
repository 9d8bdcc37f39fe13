//! The admission pipeline.
//!
//! Walks the configured controllers in priority order for each request:
//!
//! ```text
//!   admit(request)
//!     │
//!     ├─▶ controller[0].try_admit ── false/err ──┐
//!     ├─▶ controller[1].try_admit ── false/err ──┤
//!     │        ...                               ▼
//!     │                                  on_complete for every
//!     ▼                                  controller consulted,
//!   AdmissionGuard                       newest first; Rejection
//!     │
//!     └─ drop ─▶ on_complete for every controller, newest first
//! ```
//!
//! A controller is recorded in the guard before it is consulted, so a
//! controller that fails (or panics) is completed like the ones before it.
//! The timeout is one budget for the whole walk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sluice_core::{Clock, Request, RequestId, SystemClock, DEFAULT_TIMEOUT_MS};
use tracing::{debug, info, warn};

use crate::controller::{ControllerStats, FlowController, Ticket};
use crate::error::FlowError;

/// Response header carrying the time spent in admission, in milliseconds.
pub const DELAY_HEADER: &str = "X-Control-Flow-Delay-ms";

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// A controller did not admit the request within the timeout.
    #[error("request not admitted by {controller} after {waited_ms}ms")]
    Timeout {
        /// Controller that refused.
        controller: String,
        /// Time spent in admission.
        waited_ms: u64,
    },

    /// A rate limit was exceeded.
    #[error("too many requests for {context}: limit {limit} per period")]
    TooManyRequests {
        /// Requests the limit applies to.
        context: String,
        /// Requests allowed per period.
        limit: u64,
        /// Start of the next period, epoch milliseconds.
        reset_at_ms: u64,
    },

    /// A controller failed unexpectedly.
    #[error("controller {controller} failed: {message}")]
    Failed {
        /// Controller that failed.
        controller: String,
        /// Failure description.
        message: String,
    },
}

impl Rejection {
    /// HTTP status code a dispatcher should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 503,
            Self::TooManyRequests { .. } => 429,
            Self::Failed { .. } => 500,
        }
    }
}

/// Proof of admission.
///
/// Dropping the guard, or calling [`complete`](Self::complete), notifies every
/// consulted controller exactly once.
#[derive(Debug)]
#[must_use = "dropping the guard immediately completes the request"]
pub struct AdmissionGuard {
    request_id: RequestId,
    entries: Vec<(Arc<dyn FlowController>, Ticket)>,
    waited: Duration,
}

impl AdmissionGuard {
    const fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            entries: Vec::new(),
            waited: Duration::ZERO,
        }
    }

    /// Request this guard admits.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Time spent in admission.
    #[must_use]
    pub const fn waited(&self) -> Duration {
        self.waited
    }

    /// Number of controllers consulted.
    #[must_use]
    pub fn consulted(&self) -> usize {
        self.entries.len()
    }

    /// Completes the request.
    pub fn complete(self) {}
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        while let Some((controller, ticket)) = self.entries.pop() {
            controller.on_complete(ticket);
        }
    }
}

/// Maps a caller timeout in milliseconds to a wait bound; zero or negative
/// means wait forever.
#[must_use]
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Priority-ordered list of controllers every request walks through.
#[derive(Debug)]
pub struct FlowPipeline {
    controllers: RwLock<Arc<[Arc<dyn FlowController>]>>,
    timeout: Option<Duration>,
    delay_header: bool,
    clock: Arc<dyn Clock>,
}

impl FlowPipeline {
    /// Creates a pipeline over `controllers`, sorted by priority.
    #[must_use]
    pub fn new(controllers: Vec<Arc<dyn FlowController>>) -> Self {
        Self {
            controllers: RwLock::new(Self::ordered(controllers)),
            timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            delay_header: true,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the default timeout for [`admit`](Self::admit); `None` waits
    /// forever.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables the [`DELAY_HEADER`] on admitted requests.
    #[must_use]
    pub const fn with_delay_header(mut self, enabled: bool) -> Self {
        self.delay_header = enabled;
        self
    }

    /// Uses `clock` for reclamation ages.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn ordered(mut controllers: Vec<Arc<dyn FlowController>>) -> Arc<[Arc<dyn FlowController>]> {
        controllers.sort_by_key(|c| c.priority());
        for (position, controller) in controllers.iter().enumerate() {
            info!(
                position,
                controller = controller.name(),
                priority = controller.priority(),
                "flow controller configured"
            );
        }
        controllers.into()
    }

    /// Current controllers in evaluation order.
    #[must_use]
    pub fn controllers(&self) -> Arc<[Arc<dyn FlowController>]> {
        Arc::clone(&self.controllers.read())
    }

    /// The default timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Replaces the controller list.
    ///
    /// Requests already admitted complete against the controllers that
    /// admitted them.
    pub fn reconfigure(&self, controllers: Vec<Arc<dyn FlowController>>) {
        let ordered = Self::ordered(controllers);
        info!(controllers = ordered.len(), "flow controllers reconfigured");
        *self.controllers.write() = ordered;
    }

    /// Admits `request` using the default timeout.
    ///
    /// # Errors
    ///
    /// Returns the reason the request was refused.
    pub fn admit(&self, request: &mut dyn Request) -> Result<AdmissionGuard, Rejection> {
        self.admit_with_timeout(request, self.timeout)
    }

    /// Admits `request`, spending at most `timeout` across all controllers.
    /// `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns the reason the request was refused. By then every controller
    /// consulted has already been completed.
    pub fn admit_with_timeout(
        &self,
        request: &mut dyn Request,
        timeout: Option<Duration>,
    ) -> Result<AdmissionGuard, Rejection> {
        let started = Instant::now();
        let deadline = timeout.and_then(|t| started.checked_add(t));
        let controllers = self.controllers();
        let id = request.id();
        let mut guard = AdmissionGuard::new(id);

        for controller in controllers.iter() {
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        debug!(
                            request = %id,
                            controller = controller.name(),
                            "timeout budget exhausted"
                        );
                        return Err(Rejection::Timeout {
                            controller: controller.name().to_string(),
                            waited_ms: millis(started.elapsed()),
                        });
                    }
                    Some(left)
                }
            };

            let index = guard.entries.len();
            guard.entries.push((Arc::clone(controller), Ticket::new(id)));
            let outcome = controller.try_admit(request, remaining, &mut guard.entries[index].1);

            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    debug!(request = %id, controller = controller.name(), "request not admitted");
                    return Err(Rejection::Timeout {
                        controller: controller.name().to_string(),
                        waited_ms: millis(started.elapsed()),
                    });
                }
                Err(FlowError::TooManyRequests {
                    context,
                    limit,
                    reset_at_ms,
                }) => {
                    debug!(request = %id, controller = controller.name(), "rate limit exceeded");
                    return Err(Rejection::TooManyRequests {
                        context,
                        limit,
                        reset_at_ms,
                    });
                }
                Err(e) => {
                    warn!(
                        request = %id,
                        controller = controller.name(),
                        error = %e,
                        "controller failed"
                    );
                    return Err(Rejection::Failed {
                        controller: controller.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        guard.waited = started.elapsed();
        if self.delay_header {
            request
                .response_mut()
                .set_header(DELAY_HEADER, millis(guard.waited).to_string());
        }
        Ok(guard)
    }

    /// Statistics of every controller in evaluation order.
    #[must_use]
    pub fn stats(&self) -> Vec<ControllerStats> {
        self.controllers().iter().map(|c| c.stats()).collect()
    }

    /// Sweeps idle per-key state from every controller now. Returns the
    /// number of entries removed.
    pub fn reclaim_now(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.controllers().iter().map(|c| c.reclaim(now_ms)).sum()
    }

    /// Interrupts all waiters and refuses further admissions.
    pub fn close(&self) {
        for controller in self.controllers().iter() {
            controller.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::BasicFlowController;
    use crate::matcher::OwsRequestMatcher;
    use crate::rate::RateFlowController;
    use sluice_core::{HttpRequest, ManualClock};
    use std::net::IpAddr;

    fn request() -> HttpRequest {
        HttpRequest::new().with_remote_addr("10.0.0.1".parse::<IpAddr>().unwrap())
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(-5), None);
        assert_eq!(timeout_from_millis(250), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_controllers_sorted_by_priority() {
        let wide: Arc<dyn FlowController> =
            Arc::new(BasicFlowController::global(100, None).unwrap());
        let narrow: Arc<dyn FlowController> =
            Arc::new(BasicFlowController::global(2, None).unwrap());
        let rate: Arc<dyn FlowController> = Arc::new(RateFlowController::new(10, 1000).unwrap());
        let pipeline = FlowPipeline::new(vec![wide, narrow, rate]);
        let names: Vec<_> = pipeline.controllers().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(
            names,
            vec!["rate[Any OGC request]=10/1000ms", "Any OGC request=2", "Any OGC request=100"]
        );
    }

    #[test]
    fn test_rate_rejection_skips_later_controllers() {
        let clock = Arc::new(ManualClock::new(0));
        let rate = Arc::new(
            RateFlowController::new(1, 60_000)
                .unwrap()
                .with_clock(clock as Arc<dyn Clock>),
        );
        let global = Arc::new(BasicFlowController::global(1, None).unwrap());
        let pipeline = FlowPipeline::new(vec![
            Arc::clone(&global) as Arc<dyn FlowController>,
            rate as Arc<dyn FlowController>,
        ]);

        let mut first = request();
        let guard = pipeline.admit(&mut first).unwrap();
        assert_eq!(guard.consulted(), 2);
        assert_eq!(global.running_count(), 1);
        assert!(first.response().header(DELAY_HEADER).is_some());

        let mut second = request();
        let rejection = pipeline.admit(&mut second).unwrap_err();
        assert_eq!(rejection.status_code(), 429);
        assert_eq!(global.running_count(), 1);
        assert_eq!(global.stats().timed_out, 0);

        guard.complete();
        assert_eq!(global.running_count(), 0);
    }

    #[test]
    fn test_refusal_completes_earlier_controllers() {
        let wfs = OwsRequestMatcher::service("WFS").unwrap();
        let wfs_only = Arc::new(BasicFlowController::for_requests(Box::new(wfs), 1, None).unwrap());
        let global = Arc::new(BasicFlowController::global(2, None).unwrap());
        let pipeline = FlowPipeline::new(vec![
            Arc::clone(&global) as Arc<dyn FlowController>,
            Arc::clone(&wfs_only) as Arc<dyn FlowController>,
        ])
        .with_timeout(Some(Duration::from_millis(20)));

        let held: Vec<_> = (0..2)
            .map(|_| pipeline.admit(&mut request().with_service("WMS")).unwrap())
            .collect();
        let rejection = pipeline.admit(&mut request().with_service("WFS")).unwrap_err();
        assert!(matches!(
            rejection,
            Rejection::Timeout { ref controller, .. } if controller == global.name()
        ));
        assert_eq!(rejection.status_code(), 503);
        assert_eq!(wfs_only.stats().admitted, 1);
        assert_eq!(wfs_only.running_count(), 0);
        assert_eq!(global.running_count(), 2);

        drop(held);
        assert_eq!(global.running_count(), 0);
    }

    #[test]
    fn test_delay_header_can_be_disabled() {
        let pipeline = FlowPipeline::new(Vec::new()).with_delay_header(false);
        let mut req = request();
        let guard = pipeline.admit(&mut req).unwrap();
        assert_eq!(guard.consulted(), 0);
        assert!(req.response().header(DELAY_HEADER).is_none());
    }

    #[test]
    fn test_reconfigure_keeps_admitted_requests() {
        let old = Arc::new(BasicFlowController::global(1, None).unwrap());
        let pipeline = FlowPipeline::new(vec![Arc::clone(&old) as Arc<dyn FlowController>]);
        let guard = pipeline.admit(&mut request()).unwrap();

        let replacement: Arc<dyn FlowController> =
            Arc::new(BasicFlowController::global(3, None).unwrap());
        pipeline.reconfigure(vec![replacement]);
        assert_eq!(pipeline.stats()[0].capacity, 3);
        assert_eq!(old.running_count(), 1);

        drop(guard);
        assert_eq!(old.running_count(), 0);
    }
}

//! Reusable test scenarios for flow-control tests.
//!
//! Scenarios define common clients, pipelines and waiting helpers that can be
//! composed into integration and stress tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sluice_core::{Clock, HttpRequest, ManualClock};
use sluice_flow::{
    BuildContext, ControllerConfig, ControllerRegistry, FlowConfig, FlowPipeline, ReclaimPolicy,
    ThreadBlocker,
};

/// Standard clients.
pub mod clients {
    use super::{HttpRequest, IpAddr, Ipv4Addr};

    /// Address of client number `n`.
    #[must_use]
    pub fn addr(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    /// A WMS `GetMap` request from client `n`.
    #[must_use]
    pub fn getmap(n: u8) -> HttpRequest {
        HttpRequest::ows("WMS", "GetMap", addr(n))
    }

    /// A WFS `GetFeature` request from client `n`.
    #[must_use]
    pub fn getfeature(n: u8) -> HttpRequest {
        HttpRequest::ows("WFS", "GetFeature", addr(n))
    }
}

/// Seeds for reproducible testing.
pub mod seeds {
    /// Standard test seeds.
    pub const REGRESSION_SEEDS: &[u64] = &[42, 12345, 0xDEAD_BEEF, 999, 7777, 0x1337, 1, 0];
}

/// Builds a pipeline from `controllers` on a manual clock starting at zero.
///
/// # Panics
///
/// Panics if the configuration is invalid.
#[must_use]
pub fn manual_pipeline(
    controllers: Vec<ControllerConfig>,
    timeout_ms: i64,
) -> (FlowPipeline, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let config = FlowConfig {
        timeout_ms,
        reclaim: ReclaimPolicy::for_testing(),
        controllers,
        ..FlowConfig::default()
    };
    let ctx = BuildContext::from_config(&config).with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
    let pipeline = ControllerRegistry::with_builtins()
        .build_pipeline_with(&config, &ctx)
        .expect("valid configuration");
    (pipeline, clock)
}

/// Rate limit of one request per minute in front of a single slot.
#[must_use]
pub fn rate_then_single_slot() -> (FlowPipeline, Arc<ManualClock>) {
    manual_pipeline(
        vec![
            ControllerConfig::new("global").with_capacity(1),
            ControllerConfig::new("rate").with_rate(1, 60_000),
        ],
        1_000,
    )
}

/// Spins until `blocker` has `n` waiters.
///
/// # Panics
///
/// Panics if the waiters do not show up within five seconds.
pub fn wait_for_queued(blocker: &dyn ThreadBlocker, n: usize) {
    wait_until(|| blocker.queued_count() >= n);
}

/// Spins until `condition` holds.
///
/// # Panics
///
/// Panics if `condition` does not hold within five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

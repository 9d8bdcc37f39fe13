//! Workload generation and execution.
//!
//! Runs one thread per synthetic client against a shared pipeline. Each
//! client draws its requests from the profile's mix with its own seeded
//! random stream, holds admitted requests for the configured time, and
//! records the outcome and admission latency of every request.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_core::HttpRequest;
use sluice_flow::{
    ControllerRegistry, ControllerStats, FlowError, FlowPipeline, Reclaimer, Rejection,
};
use tracing::{debug, info};

use crate::profiles::{ProfileError, WorkloadProfile};
use crate::verification::{Verification, Violation};

/// Error type for workload runs.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    /// The profile could not be loaded.
    #[error(transparent)]
    Profile {
        /// Underlying error.
        #[from]
        source: ProfileError,
    },
    /// The flow configuration is invalid.
    #[error("invalid flow configuration: {source}")]
    Flow {
        /// Underlying error.
        #[from]
        source: FlowError,
    },
    /// The request mix has no positive weight.
    #[error("invalid request mix: {message}")]
    InvalidMix {
        /// Error message.
        message: String,
    },
    /// A latency histogram could not be created or merged.
    #[error("latency histogram: {message}")]
    Histogram {
        /// Error message.
        message: String,
    },
    /// A thread could not be started.
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        /// What was being started.
        what: &'static str,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Address of synthetic client key `index`, in 10.1.0.0/16.
#[must_use]
pub fn client_addr(index: usize) -> IpAddr {
    let low = u32::try_from(index).unwrap_or(u32::MAX) & 0xFFFF;
    IpAddr::V4(Ipv4Addr::from(0x0A01_0000 | low))
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn new_histogram() -> Result<Histogram<u64>, WorkloadError> {
    Histogram::<u64>::new(3).map_err(|e| WorkloadError::Histogram {
        message: format!("{e:?}"),
    })
}

/// Requests currently held by clients, with the peak.
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What one client saw.
struct ClientReport {
    admitted: u64,
    timed_out: u64,
    too_many_requests: u64,
    failed: u64,
    latencies: Histogram<u64>,
    dropped_samples: u64,
}

impl ClientReport {
    fn new() -> Result<Self, WorkloadError> {
        Ok(Self {
            admitted: 0,
            timed_out: 0,
            too_many_requests: 0,
            failed: 0,
            latencies: new_histogram()?,
            dropped_samples: 0,
        })
    }

    /// Records one admission latency; a value the histogram cannot hold is
    /// counted as dropped.
    fn record_latency(&mut self, elapsed: Duration) {
        if self.latencies.record(micros(elapsed)).is_err() {
            self.dropped_samples += 1;
        }
    }

    fn count(&mut self, rejection: &Rejection) {
        match rejection {
            Rejection::Timeout { .. } => self.timed_out += 1,
            Rejection::TooManyRequests { .. } => self.too_many_requests += 1,
            Rejection::Failed { .. } => self.failed += 1,
        }
    }
}

/// A load run described by a profile.
#[derive(Debug, Clone)]
pub struct Workload {
    profile: WorkloadProfile,
}

impl Workload {
    /// Creates a workload from a profile.
    #[must_use]
    pub const fn new(profile: WorkloadProfile) -> Self {
        Self { profile }
    }

    /// Returns the profile.
    #[must_use]
    pub const fn profile(&self) -> &WorkloadProfile {
        &self.profile
    }

    /// Builds the profile's pipeline and runs the workload against it.
    ///
    /// # Errors
    ///
    /// Returns an error if the flow configuration or the request mix is
    /// invalid, or a thread cannot be started.
    pub fn run(&self) -> Result<WorkloadStats, WorkloadError> {
        let pipeline = Arc::new(ControllerRegistry::default().build_pipeline(&self.profile.flow)?);
        self.run_on(&pipeline)
    }

    /// Runs the workload against `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request mix is invalid or a thread cannot be
    /// started.
    #[allow(clippy::cast_precision_loss)]
    pub fn run_on(&self, pipeline: &Arc<FlowPipeline>) -> Result<WorkloadStats, WorkloadError> {
        let table = self.profile.mix.weighted();
        let mix = WeightedIndex::new(table.iter().map(|(_, _, weight)| *weight)).map_err(|e| {
            WorkloadError::InvalidMix {
                message: e.to_string(),
            }
        })?;

        let period = self.profile.execution.reclaim_period_ms;
        let reclaimer = if period > 0 {
            let reclaimer = Reclaimer::spawn(Arc::clone(pipeline), Duration::from_millis(period))
                .map_err(|source| WorkloadError::Spawn {
                    what: "reclaimer",
                    source,
                })?;
            Some(reclaimer)
        } else {
            None
        };

        info!(
            profile = %self.profile.name,
            clients = self.profile.clients.clients,
            requests = self.profile.total_requests(),
            controllers = pipeline.controllers().len(),
            "workload starting"
        );

        let in_flight = InFlight::default();
        let start = Instant::now();
        let reports = thread::scope(|scope| {
            let handles = (0..self.profile.clients.clients)
                .map(|client| {
                    thread::Builder::new()
                        .name(format!("client-{client}"))
                        .spawn_scoped(scope, {
                            let mix = &mix;
                            let in_flight = &in_flight;
                            move || self.run_client(client, pipeline, mix, in_flight)
                        })
                        .map_err(|source| WorkloadError::Spawn {
                            what: "client",
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect::<Result<Vec<_>, _>>()
        })?;
        let duration = start.elapsed();
        if let Some(reclaimer) = reclaimer {
            reclaimer.stop();
        }

        let mut latencies = new_histogram()?;
        let mut stats = WorkloadStats::default();
        for report in &reports {
            stats.admitted += report.admitted;
            stats.timed_out += report.timed_out;
            stats.too_many_requests += report.too_many_requests;
            stats.failed += report.failed;
            stats.latency_samples_dropped += report.dropped_samples;
            latencies.add(&report.latencies).map_err(|e| WorkloadError::Histogram {
                message: format!("{e:?}"),
            })?;
        }
        stats.requests_total = stats.outcomes();
        stats.latency_p50 = latencies.value_at_quantile(0.50) as f64 / 1000.0;
        stats.latency_p95 = latencies.value_at_quantile(0.95) as f64 / 1000.0;
        stats.latency_p99 = latencies.value_at_quantile(0.99) as f64 / 1000.0;
        stats.latency_max = latencies.max() as f64 / 1000.0;
        let seconds = duration.as_secs_f64().max(f64::EPSILON);
        stats.throughput_ops = stats.requests_total as f64 / seconds;
        stats.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        stats.peak_in_flight = in_flight.peak.load(Ordering::Acquire);
        stats.controllers = pipeline.stats();
        stats.violations = Verification::verify(&self.profile, &stats);

        info!(
            profile = %self.profile.name,
            admitted = stats.admitted,
            timed_out = stats.timed_out,
            too_many_requests = stats.too_many_requests,
            violations = stats.violations.len(),
            duration_ms = stats.duration_ms,
            "workload finished"
        );
        Ok(stats)
    }

    /// Sends one client's requests.
    fn run_client(
        &self,
        client: usize,
        pipeline: &FlowPipeline,
        mix: &WeightedIndex<u32>,
        in_flight: &InFlight,
    ) -> Result<ClientReport, WorkloadError> {
        let config = &self.profile.clients;
        let table = self.profile.mix.weighted();
        let seed = self.profile.execution.seed.wrapping_add(client as u64);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let addr = client_addr(client % config.keys.max(1));
        let mut report = ClientReport::new()?;

        for _ in 0..config.requests_per_client {
            let (service, operation, _) = table[mix.sample(&mut rng)];
            let mut request = HttpRequest::ows(service, operation, addr);
            if let Some(header) = &config.priority_header {
                request = request.with_header(header.clone(), rng.gen_range(0..10).to_string());
            }

            let started = Instant::now();
            let outcome = pipeline.admit(&mut request);
            report.record_latency(started.elapsed());

            match outcome {
                Ok(guard) => {
                    report.admitted += 1;
                    in_flight.enter();
                    let jitter = if config.hold_jitter_ms > 0 {
                        rng.gen_range(0..=config.hold_jitter_ms)
                    } else {
                        0
                    };
                    thread::sleep(Duration::from_millis(config.hold_ms + jitter));
                    in_flight.exit();
                    guard.complete();
                }
                Err(rejection) => {
                    debug!(client, service, operation, %rejection, "request rejected");
                    report.count(&rejection);
                }
            }
        }
        Ok(report)
    }
}

/// Statistics from a workload execution.
#[derive(Debug, Clone, Default)]
pub struct WorkloadStats {
    /// Requests sent.
    pub requests_total: u64,
    /// Requests admitted.
    pub admitted: u64,
    /// Requests refused after waiting (HTTP 503).
    pub timed_out: u64,
    /// Requests refused by a rate limit (HTTP 429).
    pub too_many_requests: u64,
    /// Requests refused by a failing controller (HTTP 500).
    pub failed: u64,

    /// Admission latency p50 in milliseconds.
    pub latency_p50: f64,
    /// Admission latency p95 in milliseconds.
    pub latency_p95: f64,
    /// Admission latency p99 in milliseconds.
    pub latency_p99: f64,
    /// Admission latency max in milliseconds.
    pub latency_max: f64,
    /// Latency samples the histogram could not record.
    pub latency_samples_dropped: u64,

    /// Requests per second.
    pub throughput_ops: f64,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Most requests clients held at once.
    pub peak_in_flight: usize,

    /// Controller statistics after the run, in evaluation order.
    pub controllers: Vec<ControllerStats>,
    /// Verification violations found.
    pub violations: Vec<Violation>,
}

impl WorkloadStats {
    /// Number of outcomes recorded.
    #[must_use]
    pub const fn outcomes(&self) -> u64 {
        self.admitted + self.timed_out + self.too_many_requests + self.failed
    }

    /// Whether the run found no violation.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Prints a human-readable summary.
    pub fn print_summary(&self) {
        println!("=== Workload Statistics ===");
        println!(
            "Requests: {} total, {} admitted, {} timed out, {} rate limited, {} failed",
            self.requests_total, self.admitted, self.timed_out, self.too_many_requests, self.failed
        );
        println!(
            "Admission latency: p50={:.2}ms p95={:.2}ms p99={:.2}ms max={:.2}ms",
            self.latency_p50, self.latency_p95, self.latency_p99, self.latency_max
        );
        if self.latency_samples_dropped > 0 {
            println!("Latency samples dropped: {}", self.latency_samples_dropped);
        }
        println!("Throughput: {:.0} requests/sec", self.throughput_ops);
        println!("Duration: {}ms", self.duration_ms);
        println!("Peak in flight: {}", self.peak_in_flight);
        println!("Controllers:");
        for c in &self.controllers {
            println!(
                "  {} (capacity {}): admitted={} timed_out={} rejected={} peak={} keys={}",
                c.name, c.capacity, c.admitted, c.timed_out, c.rejected, c.peak_running, c.keys
            );
        }
        println!("Violations: {}", self.violations.len());
        for v in &self.violations {
            println!("  - {v}");
        }
    }
}

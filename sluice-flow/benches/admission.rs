//! Admission benchmarks.
//!
//! Measures the uncontended admit/complete path through pipelines of growing
//! depth, and the cost of key lookup in keyed controllers.

#![allow(missing_docs)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sluice_core::HttpRequest;
use sluice_flow::{
    BasicFlowController, ControllerConfig, ControllerRegistry, FlowConfig, FlowController,
    KeyedFlowController, Ticket,
};

/// Builds a pipeline configuration with `depth` controllers.
fn pipeline_config(depth: usize) -> FlowConfig {
    let layers = [
        ControllerConfig::new("rate").with_rate(u64::MAX / 2, 60_000),
        ControllerConfig::new("ip").with_capacity(64),
        ControllerConfig::new("ows")
            .with_ows("WMS", Some("GetMap"), None)
            .with_capacity(128),
        ControllerConfig::new("global").with_capacity(256),
    ];
    layers
        .into_iter()
        .take(depth)
        .fold(FlowConfig::default(), FlowConfig::with_controller)
}

/// Benchmark a full admit/complete cycle through the pipeline.
fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_admit_complete");
    group.measurement_time(Duration::from_secs(5));
    group.throughput(Throughput::Elements(1));

    for depth in [0, 1, 2, 4] {
        let pipeline = ControllerRegistry::with_builtins()
            .build_pipeline(&pipeline_config(depth))
            .expect("valid configuration");
        group.bench_with_input(BenchmarkId::new("depth", depth), &pipeline, |b, pipeline| {
            b.iter(|| {
                let mut request = HttpRequest::ows(
                    "WMS",
                    "GetMap",
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                );
                let guard = pipeline.admit(&mut request).expect("admitted");
                black_box(guard.consulted());
                guard.complete();
            });
        });
    }
    group.finish();
}

/// Benchmark a single global controller without the pipeline.
fn bench_global_controller(c: &mut Criterion) {
    let controller = BasicFlowController::global(16, None).expect("valid capacity");
    c.bench_function("global_try_admit_on_complete", |b| {
        b.iter(|| {
            let mut request = HttpRequest::new();
            let mut ticket = Ticket::new(sluice_core::Request::id(&request));
            let admitted = controller
                .try_admit(&mut request, None, &mut ticket)
                .expect("no rate limit");
            black_box(admitted);
            controller.on_complete(ticket);
        });
    });
}

/// Benchmark keyed admission across a growing number of distinct keys.
fn bench_keyed_spread(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed_spread");
    for keys in [1_u32, 100, 10_000] {
        let controller = Arc::new(KeyedFlowController::per_ip(4).expect("valid capacity"));
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |b, &keys| {
            let mut next = 0_u32;
            b.iter(|| {
                next = (next + 1) % keys;
                let addr = IpAddr::V4(Ipv4Addr::from(0x0A00_0000 + next));
                let mut request = HttpRequest::new().with_remote_addr(addr);
                let mut ticket = Ticket::new(sluice_core::Request::id(&request));
                let admitted = controller
                    .try_admit(&mut request, None, &mut ticket)
                    .expect("no rate limit");
                black_box(admitted);
                controller.on_complete(ticket);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline, bench_global_controller, bench_keyed_spread);
criterion_main!(benches);

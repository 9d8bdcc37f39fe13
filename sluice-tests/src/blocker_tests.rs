//! Thread blocker integration and stress tests.
//!
//! Covers the properties every blocker must keep under real thread
//! interleavings:
//! - Capacity: never more than N requests hold a slot
//! - Fairness: FIFO blockers admit waiters in arrival order
//! - Priority: priority blockers admit the most urgent waiter first
//! - Timeout races: a slot is never both free and occupied

// Test-specific lint allowances.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::significant_drop_tightening)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_core::{HttpRequest, Request};
use sluice_flow::{
    HttpHeaderPriorityProvider, PriorityProvider, PriorityThreadBlocker, SimpleThreadBlocker,
    ThreadBlocker,
};

use crate::properties::{check_order, ConcurrencyProbe};
use crate::scenarios::seeds::REGRESSION_SEEDS;
use crate::scenarios::wait_for_queued;

const PRIORITY_HEADER: &str = "gs-priority";

fn priority_blocker(capacity: usize) -> Arc<PriorityThreadBlocker> {
    let provider: Arc<dyn PriorityProvider> =
        Arc::new(HttpHeaderPriorityProvider::new(PRIORITY_HEADER, 0));
    Arc::new(PriorityThreadBlocker::new(capacity, provider))
}

/// Starts a thread that waits for a slot, reports `label` once admitted,
/// then releases. Returns once the waiter is queued.
fn spawn_waiter(
    blocker: &Arc<dyn ThreadBlocker>,
    request: HttpRequest,
    label: &'static str,
    admitted: &mpsc::Sender<&'static str>,
) -> thread::JoinHandle<()> {
    let queued_before = blocker.queued_count();
    let blocker_for_thread = Arc::clone(blocker);
    let admitted = admitted.clone();
    let handle = thread::spawn(move || {
        assert!(blocker_for_thread.admit(&request, None).unwrap());
        admitted.send(label).unwrap();
        blocker_for_thread.release(request.id());
    });
    wait_for_queued(blocker.as_ref(), queued_before + 1);
    handle
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_blocker_fifo_admits_in_arrival_order() {
    let blocker: Arc<dyn ThreadBlocker> = Arc::new(SimpleThreadBlocker::new(1));
    let running = HttpRequest::new();
    assert!(blocker.admit(&running, None).unwrap());

    let (tx, rx) = mpsc::channel();
    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|label| spawn_waiter(&blocker, HttpRequest::new(), label, &tx))
        .collect();

    blocker.release(running.id());
    let order: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
    assert_eq!(check_order(&["A", "B", "C"], &order), None);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(blocker.running_count(), 0);
}

#[test]
fn test_blocker_priority_admits_most_urgent_first() {
    let blocker: Arc<dyn ThreadBlocker> = priority_blocker(1);
    let running = HttpRequest::new();
    assert!(blocker.admit(&running, None).unwrap());

    let (tx, rx) = mpsc::channel();
    let low = spawn_waiter(
        &blocker,
        HttpRequest::new().with_header(PRIORITY_HEADER, "5"),
        "p5",
        &tx,
    );
    let high = spawn_waiter(
        &blocker,
        HttpRequest::new().with_header(PRIORITY_HEADER, "10"),
        "p10",
        &tx,
    );

    blocker.release(running.id());
    let order: Vec<_> = (0..2).map(|_| rx.recv().unwrap()).collect();
    assert_eq!(check_order(&["p10", "p5"], &order), None);
    low.join().unwrap();
    high.join().unwrap();
}

#[test]
fn test_blocker_priority_ties_are_fifo() {
    let blocker: Arc<dyn ThreadBlocker> = priority_blocker(1);
    let running = HttpRequest::new();
    assert!(blocker.admit(&running, None).unwrap());

    let (tx, rx) = mpsc::channel();
    let handles = vec![
        spawn_waiter(&blocker, HttpRequest::new().with_header(PRIORITY_HEADER, "3"), "first", &tx),
        spawn_waiter(
            &blocker,
            HttpRequest::new().with_header(PRIORITY_HEADER, "bogus"),
            "default",
            &tx,
        ),
        spawn_waiter(&blocker, HttpRequest::new().with_header(PRIORITY_HEADER, "3"), "second", &tx),
    ];

    blocker.release(running.id());
    let order: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
    assert_eq!(check_order(&["first", "second", "default"], &order), None);
    for handle in handles {
        handle.join().unwrap();
    }
}

// ============================================================================
// Release Bookkeeping
// ============================================================================

#[test]
fn test_blocker_no_double_release() {
    for blocker in [
        Arc::new(SimpleThreadBlocker::new(1)) as Arc<dyn ThreadBlocker>,
        priority_blocker(1) as Arc<dyn ThreadBlocker>,
    ] {
        let holder = HttpRequest::new();
        let late = HttpRequest::new();
        assert!(blocker.admit(&holder, None).unwrap());
        assert!(!blocker.admit(&late, Some(Duration::from_millis(5))).unwrap());

        assert!(!blocker.release(late.id()));
        assert_eq!(blocker.running_count(), 1);
        assert!(blocker.release(holder.id()));
        assert!(!blocker.release(holder.id()));
        assert_eq!(blocker.running_count(), 0);

        let next = HttpRequest::new();
        assert!(blocker.admit(&next, Some(Duration::from_millis(5))).unwrap());
        assert!(blocker.release(next.id()));
    }
}

// ============================================================================
// Stress
// ============================================================================

/// Many threads with random hold times and timeouts against one blocker.
fn stress_capacity(blocker: &Arc<dyn ThreadBlocker>, seed: u64, threads: usize, rounds: usize) {
    let capacity = blocker.capacity();
    let probe = Arc::new(ConcurrencyProbe::new());
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let blocker = Arc::clone(blocker);
            let probe = Arc::clone(&probe);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(t as u64));
                barrier.wait();
                for _ in 0..rounds {
                    let request = HttpRequest::new()
                        .with_header(PRIORITY_HEADER, rng.gen_range(-3..=3).to_string());
                    let timeout = match rng.gen_range(0..4) {
                        0 => None,
                        n => Some(Duration::from_micros(rng.gen_range(50..=500) * n)),
                    };
                    if blocker.admit(&request, timeout).unwrap() {
                        probe.enter("blocker");
                        thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                        probe.exit("blocker");
                        assert!(blocker.release(request.id()));
                    } else {
                        assert!(!blocker.release(request.id()));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(probe.check_capacity(capacity).is_empty(), "seed {seed}");
    assert!(blocker.peak_running() <= capacity, "seed {seed}");
    assert_eq!(blocker.running_count(), 0, "seed {seed}");
    assert_eq!(blocker.queued_count(), 0, "seed {seed}");
}

#[test]
fn test_stress_blocker_fifo_capacity() {
    for &seed in &REGRESSION_SEEDS[..4] {
        let blocker: Arc<dyn ThreadBlocker> = Arc::new(SimpleThreadBlocker::new(3));
        stress_capacity(&blocker, seed, 12, 40);
    }
}

#[test]
fn test_stress_blocker_priority_capacity() {
    for &seed in &REGRESSION_SEEDS[..4] {
        let blocker: Arc<dyn ThreadBlocker> = priority_blocker(2);
        stress_capacity(&blocker, seed, 12, 40);
    }
}

/// Timeouts close to the release instant, so the deadline and the handoff
/// race. Every slot handed to a waiter that then times out must be passed on,
/// otherwise the blocker ends with a phantom running request.
#[test]
fn test_stress_blocker_timeout_release_race() {
    for &seed in REGRESSION_SEEDS {
        let blocker: Arc<dyn ThreadBlocker> = priority_blocker(1);
        let admitted = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let blocker = Arc::clone(&blocker);
                let admitted = Arc::clone(&admitted);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ ((t as u64) << 8));
                    barrier.wait();
                    for _ in 0..100 {
                        let request = HttpRequest::new();
                        let timeout = Duration::from_micros(rng.gen_range(1..=100));
                        if blocker.admit(&request, Some(timeout)).unwrap() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                            assert_eq!(blocker.running_count(), 1);
                            thread::sleep(Duration::from_micros(rng.gen_range(0..50)));
                            assert!(blocker.release(request.id()));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(admitted.load(Ordering::Relaxed) > 0, "seed {seed}");
        assert_eq!(blocker.running_count(), 0, "seed {seed}");
        assert_eq!(blocker.queued_count(), 0, "seed {seed}");
        assert_eq!(blocker.peak_running(), 1, "seed {seed}");
    }
}

#[test]
fn test_blocker_close_wakes_everyone() {
    let blocker: Arc<dyn ThreadBlocker> = Arc::new(SimpleThreadBlocker::new(1));
    let holder = HttpRequest::new();
    assert!(blocker.admit(&holder, None).unwrap());

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let blocker = Arc::clone(&blocker);
            thread::spawn(move || blocker.admit(&HttpRequest::new(), None).is_err())
        })
        .collect();
    wait_for_queued(blocker.as_ref(), 4);
    blocker.close();

    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
    assert_eq!(blocker.queued_count(), 0);
}

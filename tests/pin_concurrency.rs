// ==============================================
// PIN SAFETY HAMMER TESTS (integration)
// ==============================================
//
// Races client-side lock/unlock against background eviction driven by
// randomized priorities and rapid commits. The invariant under test: a
// token that was successfully locked is never released by a worker
// until the matching unlock. These require multi-threaded execution and
// cannot live inline.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tierkit::error::AcquireError;
use tierkit::pipeline::Pipeline;
use tierkit::token::Token;
use tierkit::traits::ResourceAdapter;

/// Payload slot the final-tier adapter fills: whether the resource is
/// materialized at the top, and a generation stamp for torn-read checks.
#[derive(Debug, Default)]
struct Slot {
    top_resident: AtomicBool,
    generation: AtomicU64,
}

/// Final-tier adapter that records violations instead of panicking in a
/// worker thread.
struct TopAdapter {
    violations: Arc<AtomicUsize>,
    generations: AtomicU64,
}

impl TopAdapter {
    fn new(violations: Arc<AtomicUsize>) -> Self {
        Self {
            violations,
            generations: AtomicU64::new(1),
        }
    }
}

impl ResourceAdapter<u32, Slot> for TopAdapter {
    fn acquire(&self, token: &Token<u32, Slot>) -> Result<u64, AcquireError> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        token.data().generation.store(generation, Ordering::Release);
        token.data().top_resident.store(true, Ordering::Release);
        Ok(1)
    }

    fn release(&self, token: &Token<u32, Slot>) -> u64 {
        // The engine must never release a token a client holds locked.
        if token.is_locked() {
            self.violations.fetch_add(1, Ordering::Relaxed);
        }
        token.data().top_resident.store(false, Ordering::Release);
        token.data().generation.store(0, Ordering::Release);
        1
    }

    fn size(&self, _token: &Token<u32, Slot>) -> u64 {
        1
    }
}

/// Lower-tier adapter: no payload slots, unit accounting.
struct RamAdapter;

impl ResourceAdapter<u32, Slot> for RamAdapter {
    fn acquire(&self, _token: &Token<u32, Slot>) -> Result<u64, AcquireError> {
        Ok(1)
    }

    fn release(&self, _token: &Token<u32, Slot>) -> u64 {
        1
    }

    fn size(&self, _token: &Token<u32, Slot>) -> u64 {
        1
    }
}

#[test]
fn locked_tokens_survive_priority_chaos() {
    const TOKENS: usize = 16;
    const LOCKER_ITERS: usize = 2_000;
    const CHAOS_ITERS: usize = 400;

    let violations = Arc::new(AtomicUsize::new(0));

    let mut pipeline: Pipeline<u32, Slot> = Pipeline::new();
    pipeline.add_tier(8, RamAdapter).unwrap();
    pipeline
        .add_tier(3, TopAdapter::new(Arc::clone(&violations)))
        .unwrap();

    let tokens: Vec<_> = (0..TOKENS)
        .map(|i| pipeline.register(i as u32, Slot::default()))
        .collect();
    pipeline.start().unwrap();
    pipeline.commit_priorities();

    let pipeline = Arc::new(pipeline);
    let barrier = Arc::new(Barrier::new(3));
    let torn_reads = Arc::new(AtomicUsize::new(0));

    // Locker: pin random tokens and verify the materialized resource
    // stays put for the duration of the pin.
    let locker = {
        let tokens = tokens.clone();
        let barrier = Arc::clone(&barrier);
        let torn_reads = Arc::clone(&torn_reads);
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0x7159_cade);
            barrier.wait();
            for _ in 0..LOCKER_ITERS {
                let token = &tokens[rng.gen_range(0..TOKENS)];
                match token.try_lock() {
                    Ok(true) => {
                        let before = token.data().generation.load(Ordering::Acquire);
                        if before != 0 {
                            // Materialized at lock time: it must still be
                            // the same materialization at unlock time.
                            thread::yield_now();
                            let after = token.data().generation.load(Ordering::Acquire);
                            if after != before {
                                torn_reads.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        token.unlock().unwrap();
                    },
                    Ok(false) => {}, // lost to an in-flight eviction
                    Err(err) => panic!("unexpected pin error: {err}"),
                }
            }
        })
    };

    // Chaos: shuffle priorities and commit as fast as possible.
    let chaos = {
        let tokens = tokens.clone();
        let pipeline = Arc::clone(&pipeline);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
            barrier.wait();
            for _ in 0..CHAOS_ITERS {
                for token in &tokens {
                    token.set_priority(rng.gen_range(0..100));
                }
                pipeline.commit_priorities();
                thread::yield_now();
            }
        })
    };

    barrier.wait();
    locker.join().unwrap();
    chaos.join().unwrap();

    assert_eq!(
        violations.load(Ordering::Relaxed),
        0,
        "a worker released a locked token"
    );
    assert_eq!(
        torn_reads.load(Ordering::Relaxed),
        0,
        "a locked token was rematerialized under a client's feet"
    );
}

#[test]
fn pin_contract_violations_are_reported_under_load() {
    let violations = Arc::new(AtomicUsize::new(0));

    let mut pipeline: Pipeline<u32, Slot> = Pipeline::new();
    pipeline.add_tier(4, RamAdapter).unwrap();
    pipeline
        .add_tier(2, TopAdapter::new(Arc::clone(&violations)))
        .unwrap();

    let token = pipeline.register(9, Slot::default());
    pipeline.register(1, Slot::default());
    pipeline.start().unwrap();
    pipeline.commit_priorities();

    // Wait for the top tier to fill so the pin is meaningful.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !token.data().top_resident.load(Ordering::Acquire) {
        assert!(
            std::time::Instant::now() < deadline,
            "token never reached the top tier"
        );
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(token.try_lock(), Ok(true));
    assert!(token.try_lock().is_err(), "double-lock must be reported");
    assert_eq!(token.unlock(), Ok(()));
    assert!(token.unlock().is_err(), "double-unlock must be reported");

    pipeline.finish();
    assert_eq!(violations.load(Ordering::Relaxed), 0);
}

//! Bounded-capacity cache tiers and their worker engine.
//!
//! Each tier owns one worker thread that moves tokens across the
//! boundary to the stage below it ("input"): promotions pull the input's
//! best token up, demotions push the tier's worst token back down. The
//! worker parks on the *input's* gate and re-evaluates whenever
//! priorities were committed or a neighbor transferred something.
//!
//! ## Architecture
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────────┐
//!   │                         worker loop                               │
//!   │                                                                   │
//!   │   input.gate.enter(close_behind = true)                           │
//!   │        │                                                          │
//!   │        ▼                                                          │
//!   │   stop requested? ── yes ──▶ Draining, exit                       │
//!   │        │ no                                                       │
//!   │        ▼                                                          │
//!   │   did_work = unload() || load()                                   │
//!   │        │                                                          │
//!   │        ▼                                                          │
//!   │   did_work? ── yes ──▶ input.gate.open()   (re-check immediately) │
//!   │        │ no                                                       │
//!   │        └──▶ park again                                            │
//!   └───────────────────────────────────────────────────────────────────┘
//!
//!   unload (demotion, self → input):
//!     over capacity, victim = resident minimum;
//!     final tier: CAS Free → Evicting, Locked victims are re-pushed
//!     (reorder, not removal); release() off-lock; push down.
//!
//!   load (promotion, input → self):
//!     candidate = input maximum; qualifies when resident is empty,
//!     there is slack, or it beats the resident minimum; acquire()
//!     off-lock; failure returns the candidate to the input unchanged.
//! ```
//!
//! ## Key Concepts
//!
//! - **One lock at a time**: a worker holds its own heap lock or the
//!   input's, never both, so no lock-order cycle can form against the
//!   orchestrator or a neighboring worker.
//! - **Lazy rebuild**: committed priority changes only mark a stage
//!   dirty; the O(n) re-heapify runs right before the next transfer
//!   decision instead of on every priority write.
//! - **Exclusive accounting**: a token's space is counted in exactly
//!   one tier, the tier whose heap it sits in. Promotion debits the
//!   input tier by its own size estimate, demotion credits it back.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::ds::{Gate, IntervalHeap};
use crate::token::TokenHandle;
use crate::traits::{Priority, ResourceAdapter};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Shared per-level state: the resident heap, its dirty flag, and the
/// gate the level above parks on.
///
/// The Source is a bare `Stage` (no capacity, no adapter, no worker);
/// every tier embeds one.
#[derive(Debug)]
pub(crate) struct Stage<P: Priority, D> {
    heap: Mutex<IntervalHeap<TokenHandle<P, D>>>,
    dirty: AtomicBool,
    gate: Gate,
}

impl<P: Priority, D> Stage<P, D> {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(IntervalHeap::new()),
            dirty: AtomicBool::new(false),
            gate: Gate::new(),
        }
    }

    pub(crate) fn heap(&self) -> MutexGuard<'_, IntervalHeap<TokenHandle<P, D>>> {
        self.heap.lock()
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Re-heapifies the (already locked) heap if priorities changed
    /// since the last rebuild.
    fn rebuild_if_dirty(&self, heap: &mut IntervalHeap<TokenHandle<P, D>>) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            heap.rebuild();
        }
    }
}

// ---------------------------------------------------------------------------
// Phases and statistics
// ---------------------------------------------------------------------------

/// Lifecycle phase of a tier's worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TierPhase {
    /// Worker loop active.
    #[default]
    Running,
    /// Stop observed; worker exited, residents not yet flushed.
    Draining,
    /// Flushed; the tier holds nothing.
    Stopped,
}

impl TierPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TierPhase::Running,
            1 => TierPhase::Draining,
            _ => TierPhase::Stopped,
        }
    }
}

/// Snapshot of one tier's gauges and transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Lifecycle phase of the tier's worker.
    pub phase: TierPhase,
    /// Tokens currently resident (heap length).
    pub resident: usize,
    /// Space currently consumed.
    pub used: u64,
    /// Configured capacity.
    pub capacity: u64,
    /// Successful promotions into this tier.
    pub promotions: u64,
    /// Successful demotions out of this tier.
    pub demotions: u64,
    /// Eviction attempts skipped because the victim was locked.
    pub pin_reorders: u64,
    /// Failed acquire calls (candidate returned to the input).
    pub acquire_failures: u64,
}

#[derive(Debug, Default)]
struct TierCounters {
    promotions: AtomicU64,
    demotions: AtomicU64,
    pin_reorders: AtomicU64,
    acquire_failures: AtomicU64,
}

impl TierCounters {
    fn inc_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_pin_reorder(&self) {
        self.pin_reorders.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_acquire_failure(&self) {
        self.acquire_failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// TierState
// ---------------------------------------------------------------------------

/// The stage directly below a tier: the Source or another tier.
pub(crate) enum TierInput<P: Priority, D> {
    Source(Arc<Stage<P, D>>),
    Tier(Arc<TierState<P, D>>),
}

impl<P: Priority, D> TierInput<P, D> {
    pub(crate) fn stage(&self) -> &Stage<P, D> {
        match self {
            TierInput::Source(stage) => stage,
            TierInput::Tier(tier) => &tier.stage,
        }
    }

    /// Removes a promoted token from the input tier's accounting and
    /// wakes its worker: the new slack may let it pull from below.
    /// The Source has no accounting and no worker.
    fn debit(&self, token: &TokenHandle<P, D>) {
        if let TierInput::Tier(tier) = self {
            tier.sub_used(tier.adapter.size(token));
            tier.wake();
        }
    }

    /// Returns a demoted token to the input tier's accounting and wakes
    /// its worker: the new pressure may force it to demote further.
    fn credit(&self, token: &TokenHandle<P, D>) {
        if let TierInput::Tier(tier) = self {
            tier.used
                .fetch_add(tier.adapter.size(token), Ordering::Relaxed);
            tier.wake();
        }
    }
}

/// One bounded-capacity layer of the pipeline and its worker state.
pub(crate) struct TierState<P: Priority, D> {
    index: usize,
    capacity: u64,
    used: AtomicU64,
    is_final: AtomicBool,
    stop: AtomicBool,
    phase: AtomicU8,
    stage: Stage<P, D>,
    input: TierInput<P, D>,
    adapter: Box<dyn ResourceAdapter<P, D>>,
    counters: TierCounters,
}

impl<P: Priority, D> TierState<P, D> {
    pub(crate) fn new(
        index: usize,
        capacity: u64,
        input: TierInput<P, D>,
        adapter: Box<dyn ResourceAdapter<P, D>>,
    ) -> Self {
        Self {
            index,
            capacity,
            used: AtomicU64::new(0),
            is_final: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            phase: AtomicU8::new(0),
            stage: Stage::new(),
            input,
            adapter,
            counters: TierCounters::default(),
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn stage(&self) -> &Stage<P, D> {
        &self.stage
    }

    pub(crate) fn input(&self) -> &TierInput<P, D> {
        &self.input
    }

    pub(crate) fn mark_final(&self) {
        self.is_final.store(true, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Clears shutdown state so a finished pipeline can start again.
    pub(crate) fn reset_for_start(&self) {
        self.stop.store(false, Ordering::Release);
        self.phase.store(0, Ordering::Release); // Running
    }

    pub(crate) fn phase(&self) -> TierPhase {
        TierPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn stats(&self) -> TierStats {
        TierStats {
            phase: self.phase(),
            resident: self.stage.heap().len(),
            used: self.used(),
            capacity: self.capacity,
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            demotions: self.counters.demotions.load(Ordering::Relaxed),
            pin_reorders: self.counters.pin_reorders.load(Ordering::Relaxed),
            acquire_failures: self.counters.acquire_failures.load(Ordering::Relaxed),
        }
    }

    fn is_final(&self) -> bool {
        self.is_final.load(Ordering::Acquire)
    }

    /// Opens the gate this tier's worker parks on.
    fn wake(&self) {
        self.input.stage().gate().open();
    }

    fn sub_used(&self, amount: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(amount))
            });
    }

    /// Worker loop. Parks on the input's gate; a cascade of transfers
    /// propagates through the pipeline by re-opening gates instead of
    /// polling.
    pub(crate) fn run(&self) {
        log::debug!("tier {} worker started", self.index);
        loop {
            self.input.stage().gate().enter(true);
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let did_work = self.unload() || self.load();
            if did_work {
                self.input.stage().gate().open();
            }
        }
        self.phase.store(1, Ordering::Release); // Draining
        log::debug!("tier {} worker draining", self.index);
    }

    /// Demotion pass: pushes the worst resident token down one boundary
    /// when the tier is over capacity. Returns whether it did work.
    fn unload(&self) -> bool {
        let is_final = self.is_final();
        let victim = {
            let mut heap = self.stage.heap();
            self.stage.rebuild_if_dirty(&mut heap);
            if self.used() <= self.capacity {
                return false;
            }
            let Some(min) = heap.peek_min().cloned() else {
                return false;
            };
            if is_final && !min.pin_state().begin_evict() {
                // Locked: force a reorder rather than a removal. Only
                // report progress if the minimum actually changed,
                // otherwise an all-locked tier would spin.
                if let Some(token) = heap.pop_min() {
                    heap.push(token);
                }
                self.counters.inc_pin_reorder();
                let moved = heap.peek_min().map(|now| !now.same(&min)).unwrap_or(false);
                return moved;
            }
            heap.pop_min();
            min
        };

        // Anti-thrashing guard: skip the demotion if it would leave the
        // tier under capacity by more than the victim's own size.
        let estimate = self.adapter.size(&victim);
        let remaining = self.used().saturating_sub(estimate);
        if self.capacity.saturating_sub(remaining) > estimate {
            if is_final {
                victim.pin_state().clear_evict();
            }
            self.stage.heap().push(victim);
            return false;
        }

        let freed = self.adapter.release(&victim);
        self.sub_used(freed);
        self.counters.inc_demotion();
        log::trace!("tier {} demoted a token (freed {freed})", self.index);

        // Settle the pin rank before the token is inserted below, so the
        // input heap orders it correctly.
        if is_final {
            victim.pin_state().clear_evict();
        }
        self.input.credit(&victim);
        self.input.stage().heap().push(victim);
        true
    }

    /// Promotion pass: pulls the input's best token up one boundary.
    /// Returns whether it did work.
    fn load(&self) -> bool {
        // Snapshot our side first; self and input locks are never held
        // together. The snapshot can go stale while the input lock is
        // taken (the tier above may transfer against us in between); a
        // misjudged promotion is corrected by the next unload pass.
        let (resident_empty, resident_min) = {
            let mut heap = self.stage.heap();
            self.stage.rebuild_if_dirty(&mut heap);
            (heap.is_empty(), heap.peek_min().map(|t| t.sort_key()))
        };
        let slack = self.used() < self.capacity;

        let candidate = {
            let input_stage = self.input.stage();
            let mut heap = input_stage.heap();
            input_stage.rebuild_if_dirty(&mut heap);
            let qualifies = match heap.peek_max() {
                None => false,
                Some(best) => {
                    resident_empty
                        || slack
                        || resident_min
                            .map(|min| best.sort_key() > min)
                            .unwrap_or(true)
                },
            };
            if !qualifies {
                return false;
            }
            match heap.pop_max() {
                Some(candidate) => candidate,
                None => return false,
            }
        };

        match self.adapter.acquire(&candidate) {
            Ok(space) => {
                self.used.fetch_add(space, Ordering::Relaxed);
                self.input.debit(&candidate);
                self.stage.heap().push(candidate);
                self.counters.inc_promotion();
                log::trace!("tier {} promoted a token (space {space})", self.index);
                // Wake the tier above us, then re-check the input for
                // further promotions.
                self.stage.gate().open();
                self.input.stage().gate().open();
                true
            },
            Err(err) => {
                // Transient: the candidate goes back unchanged and is
                // reconsidered on the next signal, never in a busy loop.
                log::debug!("tier {} acquire failed: {err}", self.index);
                self.counters.inc_acquire_failure();
                self.input.stage().heap().push(candidate);
                false
            },
        }
    }

    /// Drains every resident token down to the input stage. Called only
    /// after the worker has been joined. Pin state does not survive
    /// shutdown: locked tokens are force-freed before release.
    pub(crate) fn flush(&self) {
        let drained = self.stage.heap().drain();
        let count = drained.len();
        for token in drained {
            token.pin_state().force_free();
            let freed = self.adapter.release(&token);
            self.sub_used(freed);
            self.input.credit(&token);
            self.input.stage().heap().push(token);
        }
        self.phase.store(2, Ordering::Release); // Stopped
        log::debug!("tier {} flushed {count} tokens", self.index);
    }
}

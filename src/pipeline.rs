//! Pipeline orchestrator: tier wiring, priority commits, lifecycle.
//!
//! A [`Pipeline`] owns an ordered list of tiers atop an
//! infinite-capacity Source. Clients register tokens (resident at the
//! Source), write priorities at will, and periodically commit them; the
//! tier workers do everything else.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │  Pipeline                                                        │
//!   │                                                                  │
//!   │    tier 1  (final, capacity 2)   ◀── worker thread "tier-1"      │
//!   │      ▲ promote            │ demote                               │
//!   │    tier 0  (capacity 5)          ◀── worker thread "tier-0"      │
//!   │      ▲ promote            │ demote                               │
//!   │    Source  (unbounded, thread-less)                              │
//!   │                                                                  │
//!   │    registry: every token, for commit_priorities()                │
//!   │    priority lock: guards the pending → staged snapshot           │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Batched visibility**: workers only see priorities as of the last
//!   [`commit_priorities`](Pipeline::commit_priorities); a burst of
//!   [`set_priority`](crate::token::Token::set_priority) calls costs one
//!   re-evaluation, not many.
//! - **Capacity ordering**: an upper tier may not be larger than the
//!   tier below it; [`add_tier`](Pipeline::add_tier) rejects the
//!   misconfiguration outright since it would make promotion pointless.
//! - **Cooperative shutdown**: [`finish`](Pipeline::finish) stops
//!   workers top-down with a stop flag plus one gate-open each, then
//!   flushes every tier back down to the Source.
//!
//! ## Example Usage
//!
//! ```
//! use tierkit::pipeline::Pipeline;
//! use tierkit::traits::NullAdapter;
//!
//! let mut pipeline: Pipeline<u32, &str> = Pipeline::new();
//! pipeline.add_tier(4, NullAdapter::new(1)).unwrap();
//! pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
//!
//! let token = pipeline.register(10, "tile:0/0/0");
//! pipeline.start().unwrap();
//!
//! token.set_priority(99);
//! pipeline.commit_priorities();
//!
//! pipeline.finish();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, MutexGuard};

use crate::ds::IntervalHeap;
use crate::error::ConfigError;
use crate::tier::{Stage, TierInput, TierState, TierStats};
use crate::token::TokenHandle;
use crate::traits::{Priority, ResourceAdapter};

/// Where a token is resident, as observed under [`Pipeline::pause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Resident at the unbounded Source.
    Source,
    /// Resident in the tier with this index (0 = bottom-most).
    Tier(usize),
}

/// Orchestrator for a multi-tier priority-driven cache pipeline.
pub struct Pipeline<P: Priority, D> {
    source: Arc<Stage<P, D>>,
    tiers: Vec<Arc<TierState<P, D>>>,
    workers: Vec<JoinHandle<()>>,
    /// Priority lock doubling as the token registry: commits hold it
    /// while snapshotting, registrations push under it.
    registry: Mutex<Vec<TokenHandle<P, D>>>,
    commit_requested: AtomicBool,
    running: bool,
}

impl<P: Priority, D> Pipeline<P, D> {
    /// Creates an empty pipeline: just the Source, no tiers.
    pub fn new() -> Self {
        Self {
            source: Arc::new(Stage::new()),
            tiers: Vec::new(),
            workers: Vec::new(),
            registry: Mutex::new(Vec::new()),
            commit_requested: AtomicBool::new(false),
            running: false,
        }
    }

    /// Appends a tier above the previous one (or above the Source).
    ///
    /// Rejects zero capacity and a capacity exceeding the tier below:
    /// a smaller lower tier could never hold what a larger upper tier
    /// demotes into it, which would make the promotion invariant
    /// unsatisfiable.
    pub fn add_tier(
        &mut self,
        capacity: u64,
        adapter: impl ResourceAdapter<P, D> + 'static,
    ) -> Result<(), ConfigError> {
        if self.running {
            return Err(ConfigError::new("cannot add a tier to a started pipeline"));
        }
        if capacity == 0 {
            return Err(ConfigError::new("tier capacity must be > 0"));
        }
        if let Some(below) = self.tiers.last() {
            if capacity > below.capacity() {
                return Err(ConfigError::new(format!(
                    "tier capacity {} exceeds capacity {} of the tier below it",
                    capacity,
                    below.capacity()
                )));
            }
        }

        let input = match self.tiers.last() {
            Some(below) => TierInput::Tier(Arc::clone(below)),
            None => TierInput::Source(Arc::clone(&self.source)),
        };
        let tier = TierState::new(self.tiers.len(), capacity, input, Box::new(adapter));
        self.tiers.push(Arc::new(tier));
        Ok(())
    }

    /// Creates a token resident at the Source and registers it for
    /// priority commits.
    ///
    /// Callable before or after [`start`](Pipeline::start); the new
    /// token becomes a promotion candidate at the next commit.
    pub fn register(&self, priority: P, data: D) -> TokenHandle<P, D> {
        let handle = TokenHandle::new(priority, data);
        let mut registry = self.registry.lock();
        self.source.heap().push(handle.clone());
        registry.push(handle.clone());
        handle
    }

    /// Marks the topmost tier final and spawns one worker per tier.
    pub fn start(&mut self) -> Result<(), ConfigError>
    where
        D: Send + Sync + 'static,
    {
        if self.running {
            return Err(ConfigError::new("pipeline is already started"));
        }
        let Some(last) = self.tiers.last() else {
            return Err(ConfigError::new("pipeline has no tiers"));
        };
        last.mark_final();

        for tier in &self.tiers {
            tier.reset_for_start();
        }
        for (index, tier) in self.tiers.iter().enumerate() {
            let tier = Arc::clone(tier);
            let worker = thread::Builder::new()
                .name(format!("tier-{index}"))
                .spawn(move || tier.run())
                .map_err(|e| ConfigError::new(format!("failed to spawn tier worker: {e}")))?;
            self.workers.push(worker);
        }
        self.running = true;
        log::debug!("pipeline started with {} tiers", self.tiers.len());
        Ok(())
    }

    /// Returns the number of configured tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Flags that a commit is wanted; consumed by
    /// [`maybe_commit`](Pipeline::maybe_commit).
    pub fn request_commit(&self) {
        self.commit_requested.store(true, Ordering::Release);
    }

    /// Returns whether a commit has been requested since the last one.
    pub fn commit_requested(&self) -> bool {
        self.commit_requested.load(Ordering::Acquire)
    }

    /// Runs [`commit_priorities`](Pipeline::commit_priorities) if one
    /// was requested. Returns whether a commit ran.
    pub fn maybe_commit(&self) -> bool {
        if self.commit_requested.swap(false, Ordering::AcqRel) {
            self.commit_priorities();
            true
        } else {
            false
        }
    }

    /// Makes all pending priority writes visible to the worker threads.
    ///
    /// Under the priority lock: snapshots every registered token's
    /// pending priority, then (one heap lock at a time, top to bottom)
    /// adopts the snapshot for every resident token and marks the stage
    /// dirty, and finally opens every gate so each worker re-evaluates.
    ///
    /// Tokens briefly held by a worker mid-transfer miss the adoption
    /// round and keep their previous committed priority until the next
    /// commit; ordering is eventually consistent by design.
    pub fn commit_priorities(&self) {
        let registry = self.registry.lock();
        for token in registry.iter() {
            token.commit();
        }

        for stage in self.stages_top_down() {
            {
                let heap = stage.heap();
                for token in heap.iter() {
                    token.adopt_committed();
                }
            }
            stage.mark_dirty();
        }
        drop(registry);

        self.source.gate().open();
        for tier in &self.tiers {
            tier.stage().gate().open();
        }
    }

    /// Stops the world for consistent inspection.
    ///
    /// Acquires every heap lock in a fixed top-to-bottom order (then the
    /// Source) and returns a guard exposing residency queries. Workers
    /// stall on their next heap access until the guard is dropped.
    pub fn pause(&self) -> PausedPipeline<'_, P, D> {
        let mut tier_heaps = Vec::with_capacity(self.tiers.len());
        for tier in self.tiers.iter().rev() {
            tier_heaps.push(tier.stage().heap());
        }
        tier_heaps.reverse(); // index by tier again
        let source_heap = self.source.heap();
        PausedPipeline {
            tiers: &self.tiers,
            tier_heaps,
            source_heap,
        }
    }

    /// Snapshots per-tier gauges and counters, bottom tier first.
    pub fn stats(&self) -> Vec<TierStats> {
        self.tiers.iter().map(|tier| tier.stats()).collect()
    }

    /// Stops workers and drains every tier back to the Source.
    ///
    /// Topmost tier first: set its stop flag, open the gate below it so
    /// the worker observes the request, join the thread. A worker
    /// mid-transfer completes its current acquire/release before
    /// stopping. Afterwards every tier is flushed top to bottom; locked
    /// tokens are force-freed (locks do not survive shutdown).
    ///
    /// Idempotent; also invoked on drop.
    pub fn finish(&mut self) {
        if !self.running {
            return;
        }
        let workers = std::mem::take(&mut self.workers);
        for (tier, worker) in self.tiers.iter().zip(workers).rev() {
            tier.request_stop();
            tier.input().stage().gate().open();
            if worker.join().is_err() {
                log::error!("tier worker panicked during shutdown");
            }
        }

        for tier in self.tiers.iter().rev() {
            tier.flush();
        }
        self.running = false;
        log::debug!("pipeline finished");
    }

    /// Drains every tier back to the Source without retiring the
    /// pipeline.
    ///
    /// On a running pipeline the workers are stopped for the duration of
    /// the drain and respawned afterwards; tokens stay registered and
    /// are promotion candidates again at the next commit.
    pub fn flush(&mut self) -> Result<(), ConfigError>
    where
        D: Send + Sync + 'static,
    {
        if self.running {
            self.finish();
            self.start()
        } else {
            for tier in self.tiers.iter().rev() {
                tier.flush();
            }
            Ok(())
        }
    }
}

impl<P: Priority, D> Pipeline<P, D> {
    /// Stages in the fixed lock order: tiers top to bottom, Source last.
    fn stages_top_down(&self) -> impl Iterator<Item = &Stage<P, D>> {
        self.tiers
            .iter()
            .rev()
            .map(|tier| tier.stage())
            .chain(std::iter::once(self.source.as_ref()))
    }
}

impl<P: Priority, D> Default for Pipeline<P, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Priority, D> Drop for Pipeline<P, D> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// PausedPipeline
// ---------------------------------------------------------------------------

/// RAII guard over a paused pipeline; dropping it resumes the workers.
pub struct PausedPipeline<'a, P: Priority, D> {
    tiers: &'a [Arc<TierState<P, D>>],
    tier_heaps: Vec<MutexGuard<'a, IntervalHeap<TokenHandle<P, D>>>>,
    source_heap: MutexGuard<'a, IntervalHeap<TokenHandle<P, D>>>,
}

impl<P: Priority, D> PausedPipeline<'_, P, D> {
    /// Number of tokens resident in tier `index`.
    pub fn resident_len(&self, index: usize) -> usize {
        self.tier_heaps[index].len()
    }

    /// Number of tokens resident at the Source.
    pub fn source_len(&self) -> usize {
        self.source_heap.len()
    }

    /// Space consumed by tier `index`.
    pub fn used(&self, index: usize) -> u64 {
        self.tiers[index].used()
    }

    /// Finds where a token is resident. `None` means it is mid-transfer
    /// in a worker's hands (only possible while workers run between
    /// this guard's lock acquisitions; stable once they are parked).
    pub fn locate(&self, token: &TokenHandle<P, D>) -> Option<Residency> {
        for (index, heap) in self.tier_heaps.iter().enumerate() {
            if heap.iter().any(|t| t.same(token)) {
                return Some(Residency::Tier(index));
            }
        }
        if self.source_heap.iter().any(|t| t.same(token)) {
            return Some(Residency::Source);
        }
        None
    }

    /// Explicit resume; equivalent to dropping the guard.
    pub fn resume(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NullAdapter;

    #[test]
    fn pipeline_rejects_zero_capacity() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        let err = pipeline.add_tier(0, NullAdapter::new(1)).unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn pipeline_rejects_upper_tier_larger_than_lower() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline.add_tier(4, NullAdapter::new(1)).unwrap();
        let err = pipeline.add_tier(8, NullAdapter::new(1)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        // Equal or smaller is fine.
        pipeline.add_tier(4, NullAdapter::new(1)).unwrap();
        pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
    }

    #[test]
    fn pipeline_rejects_start_without_tiers() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        assert!(pipeline.start().is_err());
    }

    #[test]
    fn pipeline_rejects_double_start_and_late_add_tier() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.start().is_err());
        assert!(pipeline.add_tier(1, NullAdapter::new(1)).is_err());
        pipeline.finish();
    }

    #[test]
    fn pipeline_registers_tokens_at_the_source() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
        let a = pipeline.register(1, ());
        let _b = pipeline.register(2, ());

        let paused = pipeline.pause();
        assert_eq!(paused.source_len(), 2);
        assert_eq!(paused.resident_len(0), 0);
        assert_eq!(paused.locate(&a), Some(Residency::Source));
    }

    #[test]
    fn pipeline_commit_request_flag_is_consumed_once() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
        assert!(!pipeline.maybe_commit());
        pipeline.request_commit();
        assert!(pipeline.commit_requested());
        assert!(pipeline.maybe_commit());
        assert!(!pipeline.maybe_commit());
    }

    #[test]
    fn pipeline_commit_adopts_priorities_for_resident_tokens() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
        let token = pipeline.register(1, ());
        token.set_priority(9);
        assert_eq!(token.committed_priority(), 1);

        pipeline.commit_priorities();
        assert_eq!(token.committed_priority(), 9);
    }

    #[test]
    fn pipeline_finish_is_idempotent() {
        let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
        pipeline.add_tier(2, NullAdapter::new(1)).unwrap();
        pipeline.register(1, ());
        pipeline.start().unwrap();
        pipeline.commit_priorities();
        pipeline.finish();
        pipeline.finish();
    }
}

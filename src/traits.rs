//! # Resource Adapter Traits
//!
//! This module defines the seam between the generic tier engine and the
//! concrete resource kinds it manages (decoded images, GPU textures,
//! streamed mesh tiles, ...). A tier never materializes anything itself:
//! it asks its [`ResourceAdapter`] to do the work and only keeps the
//! accounting.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                     Tier worker thread                           │
//!   │                                                                  │
//!   │   promotion:  pop candidate ──▶ adapter.acquire(token)           │
//!   │                                   │ Ok(space)  → resident, +size │
//!   │                                   │ Err(_)     → return to input │
//!   │                                                                  │
//!   │   demotion:   pop victim ─────▶ adapter.release(token)           │
//!   │                                   │ freed      → push down, -size│
//!   │                                                                  │
//!   │   accounting: adapter.size(token) → estimate (no side effects)   │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **One adapter per tier**: each tier is configured with its own
//!   adapter at [`add_tier`](crate::pipeline::Pipeline::add_tier) time,
//!   so a RAM tier and a GPU tier of the same pipeline can materialize
//!   the same token differently.
//! - **No locks held**: every adapter call is made with no engine lock
//!   held. Adapters may block on I/O, decode work, or driver uploads.
//! - **Space units are opaque**: the engine only compares the `u64`
//!   amounts returned by the adapter against the tier capacity; bytes,
//!   texels, or entry counts all work.

use crate::error::AcquireError;
use crate::token::Token;

/// Marker trait for priority keys.
///
/// Blanket-implemented for every type that is cheap to copy, totally
/// ordered, and shareable across threads. `u32`, `u64`, `i64`, and
/// small tuples of these all qualify.
pub trait Priority: Copy + Ord + Send + Sync + 'static {}

impl<T: Copy + Ord + Send + Sync + 'static> Priority for T {}

/// Resource-kind hooks called by a tier's worker thread.
///
/// Implementations must be safe to call without any engine lock held;
/// the calling tier removes the token from its heap bookkeeping before
/// invoking them, so they are free to block.
///
/// # Example
///
/// ```
/// use tierkit::error::AcquireError;
/// use tierkit::token::Token;
/// use tierkit::traits::ResourceAdapter;
///
/// /// Counts entries instead of bytes: every resource costs 1.
/// struct UnitAdapter;
///
/// impl ResourceAdapter<u32, String> for UnitAdapter {
///     fn acquire(&self, _token: &Token<u32, String>) -> Result<u64, AcquireError> {
///         Ok(1)
///     }
///
///     fn release(&self, _token: &Token<u32, String>) -> u64 {
///         1
///     }
///
///     fn size(&self, _token: &Token<u32, String>) -> u64 {
///         1
///     }
/// }
/// ```
pub trait ResourceAdapter<P: Priority, D>: Send + Sync {
    /// Materializes the resource at this tier (decode, upload, ...).
    ///
    /// Returns the space consumed on success. On failure the engine
    /// pushes the token back where it came from and retries on the next
    /// signal, never in a busy loop.
    fn acquire(&self, token: &Token<P, D>) -> Result<u64, AcquireError>;

    /// Discards this tier's materialization of the resource.
    ///
    /// Returns the space freed. Must not fail: a resource that was
    /// acquired can always be dropped.
    fn release(&self, token: &Token<P, D>) -> u64;

    /// Estimates the space the resource occupies at this tier without
    /// materializing or discarding anything.
    fn size(&self, token: &Token<P, D>) -> u64;
}

/// Adapter that tracks no real storage: every resource costs a fixed
/// number of units.
///
/// Useful for tests, doctests, and entry-count (rather than byte-count)
/// capacity schemes.
///
/// # Example
///
/// ```
/// use tierkit::pipeline::Pipeline;
/// use tierkit::traits::NullAdapter;
///
/// let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
/// pipeline.add_tier(4, NullAdapter::new(1)).unwrap();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NullAdapter {
    unit: u64,
}

impl NullAdapter {
    /// Creates an adapter where every resource costs `unit` space.
    pub fn new(unit: u64) -> Self {
        Self { unit }
    }
}

impl<P: Priority, D> ResourceAdapter<P, D> for NullAdapter {
    fn acquire(&self, _token: &Token<P, D>) -> Result<u64, AcquireError> {
        Ok(self.unit)
    }

    fn release(&self, _token: &Token<P, D>) -> u64 {
        self.unit
    }

    fn size(&self, _token: &Token<P, D>) -> u64 {
        self.unit
    }
}

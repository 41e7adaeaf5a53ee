//! Per-resource records shared between client threads and tier workers.
//!
//! A [`Token`] carries three priority cells and a pin state:
//!
//! ```text
//!   client thread                orchestrator              tier worker
//!   ─────────────                ────────────              ───────────
//!   set_priority ──▶ pending ──▶ commit() ──▶ staged ──▶ adopt_committed()
//!                    (any time)  (priority lock)          (heap lock)
//!                                                             │
//!                                                             ▼
//!                                                         committed
//!                                                 (authoritative ordering key)
//! ```
//!
//! Worker threads only ever order tokens by the last *committed*
//! snapshot; a burst of `set_priority` calls costs nothing until the
//! orchestrator commits.
//!
//! ## Pin states
//!
//! `pin_state` is a single atomic with three values, meaningful once the
//! token reaches the final tier:
//!
//! ```text
//!              try_lock (CAS)                begin_evict (CAS)
//!   Free ──────────────────────▶ Locked      Free ──────▶ Evicting
//!     ▲──────────────────────────┘             ▲────────────┘
//!              unlock (CAS)                 clear_evict / force_free
//! ```
//!
//! Locked and Evicting are mutually exclusive by construction: the CAS
//! transitions make "who may read" and "who may evict" compete for the
//! same slot instead of relying on convention.
//!
//! The heap comparator orders by `(pin rank, committed priority)` with
//! Locked > Free > Evicting, so a locked token is never the minimum of a
//! freshly rebuilt heap and is never chosen by eviction logic.

use std::ops::Deref;
use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;

use crate::error::PinError;
use crate::traits::Priority;

const EVICTING: i8 = -1;
const FREE: i8 = 0;
const LOCKED: i8 = 1;

// ---------------------------------------------------------------------------
// PinState
// ---------------------------------------------------------------------------

/// Tagged atomic pin state with CAS-based transitions.
///
/// Client locking never waits on a tier's heap lock: this is the one
/// token field mutated lock-free.
#[derive(Debug)]
pub(crate) struct PinState(AtomicI8);

impl PinState {
    fn new() -> Self {
        Self(AtomicI8::new(FREE))
    }

    /// `Free -> Locked`. `Ok(false)` when losing to an in-flight
    /// eviction, `Err` on a double-lock.
    fn try_lock(&self) -> Result<bool, PinError> {
        match self
            .0
            .compare_exchange(FREE, LOCKED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(true),
            Err(EVICTING) => Ok(false),
            Err(_) => Err(PinError::AlreadyLocked),
        }
    }

    /// `Locked -> Free`. `Err` when the token was not locked.
    fn unlock(&self) -> Result<(), PinError> {
        self.0
            .compare_exchange(LOCKED, FREE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| PinError::NotLocked)
    }

    /// `Free -> Evicting`; fails when the token is locked.
    pub(crate) fn begin_evict(&self) -> bool {
        self.0
            .compare_exchange(FREE, EVICTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ends an eviction attempt (completed or abandoned): back to Free.
    pub(crate) fn clear_evict(&self) {
        self.0.store(FREE, Ordering::Release);
    }

    /// Unconditionally resets to Free. Used by shutdown flush: locks do
    /// not survive shutdown.
    pub(crate) fn force_free(&self) {
        self.0.store(FREE, Ordering::Release);
    }

    /// Ordering rank: Locked(1) > Free(0) > Evicting(-1).
    pub(crate) fn rank(&self) -> i8 {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Per-resource record: priority cells, pin state, and embedder payload.
///
/// The payload `D` carries the resource identity and whatever slots the
/// tier adapters fill (decoded buffers, texture handles, ...). The
/// engine never inspects it.
///
/// # Example
///
/// ```
/// use tierkit::token::Token;
///
/// let token: Token<u32, &str> = Token::new(7, "tile:3/5/2");
/// assert_eq!(token.get_priority(), 7);
/// assert_eq!(*token.data(), "tile:3/5/2");
///
/// token.set_priority(42); // pending only, until the next commit
/// assert_eq!(token.get_priority(), 42);
/// ```
pub struct Token<P, D> {
    pending: AtomicCell<P>,
    staged: AtomicCell<P>,
    committed: AtomicCell<P>,
    pin: PinState,
    data: D,
}

impl<P: Priority, D> Token<P, D> {
    /// Creates a token with an initial priority and payload.
    pub fn new(priority: P, data: D) -> Self {
        Self {
            pending: AtomicCell::new(priority),
            staged: AtomicCell::new(priority),
            committed: AtomicCell::new(priority),
            pin: PinState::new(),
            data,
        }
    }

    /// Writes the pending priority. Callable by any client thread at
    /// any time; takes effect at the next
    /// [`commit_priorities`](crate::pipeline::Pipeline::commit_priorities).
    pub fn set_priority(&self, priority: P) {
        self.pending.store(priority);
    }

    /// Reads back the pending priority.
    pub fn get_priority(&self) -> P {
        self.pending.load()
    }

    /// Reads the last committed (worker-visible) priority.
    pub fn committed_priority(&self) -> P {
        self.committed.load()
    }

    /// Snapshots pending into the staging cell. Called by the
    /// orchestrator under the priority lock.
    pub(crate) fn commit(&self) {
        self.staged.store(self.pending.load());
    }

    /// Adopts the staged snapshot as the authoritative ordering key.
    /// Called while the owning stage's heap lock is held.
    pub(crate) fn adopt_committed(&self) {
        self.committed.store(self.staged.load());
    }

    /// Attempts to pin the token against eviction.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` when the token is
    /// currently being evicted (retry after the next commit), and
    /// `Err(PinError::AlreadyLocked)` on a double-lock. Meaningful only
    /// for tokens resident in the final tier; callers are expected to
    /// check their payload for the materialized resource after locking.
    pub fn try_lock(&self) -> Result<bool, PinError> {
        self.pin.try_lock()
    }

    /// Releases a pin taken with [`try_lock`](Self::try_lock).
    pub fn unlock(&self) -> Result<(), PinError> {
        self.pin.unlock()
    }

    /// Returns whether the token is currently pinned by a client.
    pub fn is_locked(&self) -> bool {
        self.pin.rank() == LOCKED
    }

    /// Pins the token and returns an RAII guard over the payload.
    ///
    /// `Ok(None)` means the token lost the race to an in-flight
    /// eviction. The guard unlocks on drop; the payload reference it
    /// derefs to is guaranteed not to be evicted for the guard's
    /// lifetime.
    ///
    /// # Example
    ///
    /// ```
    /// use tierkit::token::Token;
    ///
    /// let token: Token<u32, String> = Token::new(0, "payload".into());
    /// {
    ///     let guard = token.read().unwrap().expect("not evicting");
    ///     assert_eq!(&*guard, "payload");
    ///     assert!(token.is_locked());
    /// }
    /// assert!(!token.is_locked());
    /// ```
    pub fn read(&self) -> Result<Option<ReadGuard<'_, P, D>>, PinError> {
        match self.try_lock()? {
            true => Ok(Some(ReadGuard { token: self })),
            false => Ok(None),
        }
    }

    /// Borrows the embedder payload.
    ///
    /// Always accessible; the residency guarantee only holds while the
    /// token is locked.
    pub fn data(&self) -> &D {
        &self.data
    }

    pub(crate) fn pin_state(&self) -> &PinState {
        &self.pin
    }

    /// Heap ordering key: pin rank first, committed priority second.
    pub(crate) fn sort_key(&self) -> (i8, P) {
        (self.pin.rank(), self.committed.load())
    }
}

impl<P: Priority + std::fmt::Debug, D: std::fmt::Debug> std::fmt::Debug for Token<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("pending", &self.pending.load())
            .field("committed", &self.committed.load())
            .field("pin_rank", &self.pin.rank())
            .field("data", &self.data)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ReadGuard
// ---------------------------------------------------------------------------

/// RAII pin over a token's payload; unlocks on drop.
#[derive(Debug)]
pub struct ReadGuard<'a, P: Priority, D> {
    token: &'a Token<P, D>,
}

impl<P: Priority, D> Deref for ReadGuard<'_, P, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.token.data
    }
}

impl<P: Priority, D> Drop for ReadGuard<'_, P, D> {
    fn drop(&mut self) {
        // The guard is the lock holder, so the CAS cannot fail.
        let _ = self.token.pin.unlock();
    }
}

// ---------------------------------------------------------------------------
// TokenHandle
// ---------------------------------------------------------------------------

/// Shared handle to a [`Token`], held by the client and by exactly one
/// stage heap at a time.
///
/// Ordering compares `(pin rank, committed priority)`; two handles to
/// distinct tokens with equal keys compare equal for heap purposes.
/// Use [`same`](TokenHandle::same) for identity.
pub struct TokenHandle<P, D>(Arc<Token<P, D>>);

impl<P: Priority + std::fmt::Debug, D: std::fmt::Debug> std::fmt::Debug for TokenHandle<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TokenHandle").field(&self.0).finish()
    }
}

impl<P: Priority, D> TokenHandle<P, D> {
    /// Creates a token and returns the first handle to it.
    pub fn new(priority: P, data: D) -> Self {
        Self(Arc::new(Token::new(priority, data)))
    }

    /// Returns whether two handles refer to the same token.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<P, D> Clone for TokenHandle<P, D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P, D> Deref for TokenHandle<P, D> {
    type Target = Token<P, D>;

    fn deref(&self) -> &Token<P, D> {
        &self.0
    }
}

impl<P: Priority, D> PartialEq for TokenHandle<P, D> {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl<P: Priority, D> Eq for TokenHandle<P, D> {}

impl<P: Priority, D> PartialOrd for TokenHandle<P, D> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Priority, D> Ord for TokenHandle<P, D> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

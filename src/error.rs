//! Error types for the tierkit library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when pipeline configuration is invalid
//!   (e.g. zero capacity, an upper tier larger than the tier below it).
//! - [`PinError`]: Returned on pin-protocol contract violations by the
//!   client (double-lock, unlock of an unlocked token).
//! - [`AcquireError`]: Returned by a [`ResourceAdapter`](crate::traits::ResourceAdapter)
//!   when materializing a resource fails; the engine treats it as
//!   transient and retries on the next signal.
//! - [`InvariantError`]: Returned when internal data-structure invariants
//!   are violated (debug-only `check_invariants` methods).
//!
//! ## Example Usage
//!
//! ```
//! use tierkit::error::ConfigError;
//! use tierkit::pipeline::Pipeline;
//! use tierkit::traits::NullAdapter;
//!
//! let mut pipeline: Pipeline<u32, ()> = Pipeline::new();
//! pipeline.add_tier(8, NullAdapter::new(1)).unwrap();
//!
//! // An upper tier may not be larger than the tier below it.
//! let err: ConfigError = pipeline.add_tier(16, NullAdapter::new(1)).unwrap_err();
//! assert!(err.to_string().contains("capacity"));
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when pipeline configuration parameters are invalid.
///
/// Produced by [`Pipeline::add_tier`](crate::pipeline::Pipeline::add_tier)
/// and [`Pipeline::start`](crate::pipeline::Pipeline::start). Carries a
/// human-readable description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// PinError
// ---------------------------------------------------------------------------

/// Error returned on a pin-protocol contract violation.
///
/// Locking an already-locked token or unlocking a token that is not
/// locked indicates a reference-counting bug in the caller and is
/// reported rather than silently ignored. Contention with background
/// eviction is *not* an error:
/// [`Token::try_lock`](crate::token::Token::try_lock) returns
/// `Ok(false)` for a token that is currently being evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// `try_lock` was called on a token that is already locked.
    AlreadyLocked,
    /// `unlock` was called on a token that is not locked.
    NotLocked,
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinError::AlreadyLocked => f.write_str("token is already locked"),
            PinError::NotLocked => f.write_str("token is not locked"),
        }
    }
}

impl std::error::Error for PinError {}

// ---------------------------------------------------------------------------
// AcquireError
// ---------------------------------------------------------------------------

/// Error returned by a resource adapter when materialization fails.
///
/// The engine recovers locally: the candidate token is returned to the
/// tier it was being promoted from and reconsidered on the next signal,
/// never in a busy loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireError(String);

impl AcquireError {
    /// Creates a new `AcquireError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AcquireError {}

// ---------------------------------------------------------------------------
// InvariantError
// ---------------------------------------------------------------------------

/// Error returned when internal data-structure invariants are violated.
///
/// Produced by debug-only `check_invariants` methods
/// (e.g. [`IntervalHeap::check_invariants`](crate::ds::IntervalHeap::check_invariants)).
/// Carries a human-readable description of which invariant failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantError(String);

impl InvariantError {
    /// Creates a new `InvariantError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvariantError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Binary, idempotent signal/wait primitive for worker wakeups.
//!
//! A [`Gate`] is used where a condition variable would over-deliver: a
//! burst of "something changed" signals from many threads must collapse
//! into a single pending wakeup for the one worker parked on the gate.
//!
//! ## Architecture
//!
//! ```text
//!   signalers                          waiter (one worker thread)
//!   ─────────                          ──────────────────────────
//!   open()  ┐
//!   open()  ├── collapse ──▶ [ open=true, one notify ]
//!   open()  ┘                          │
//!                                      ▼
//!                              enter(close_behind=true)
//!                                consumes the wakeup,
//!                                re-closes the gate,
//!                                returns to the caller
//! ```
//!
//! ## Key Concepts
//!
//! - **Idempotent open**: N calls to [`open`](Gate::open) before a
//!   single [`enter`](Gate::enter) still produce exactly one wakeup.
//! - **Close-behind**: `enter(true)` re-closes the gate before
//!   returning, so the woken worker must explicitly re-open downstream
//!   gates after re-checking its state.
//! - **No queuing**: there is never more than one pending wakeup.
//!
//! ## Example Usage
//!
//! ```
//! use tierkit::ds::Gate;
//!
//! let gate = Gate::new();
//! gate.open();
//! gate.open(); // collapses into the same pending wakeup
//!
//! gate.enter(true); // consumes it and re-closes the gate
//! assert!(!gate.is_open());
//! ```

use parking_lot::{Condvar, Mutex};

/// Single-slot notification primitive with idempotent open/close.
///
/// Unlike a raw condition variable there is no lost-wakeup hazard: a
/// signal delivered while no thread is waiting stays pending until the
/// next [`enter`](Gate::enter) consumes it.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Makes one wakeup available; idempotent.
    ///
    /// If the gate is already open this is a no-op, which is what lets
    /// a burst of priority changes collapse into a single re-evaluation.
    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cond.notify_one();
        }
    }

    /// Clears a pending wakeup if present; idempotent.
    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Blocks until a wakeup is available and consumes it.
    ///
    /// With `close_behind` the gate is re-closed before returning, so
    /// the caller must re-check its state and explicitly re-open the
    /// gate (or downstream gates) if more work remains. Without it the
    /// gate stays open for the next waiter.
    pub fn enter(&self, close_behind: bool) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        if close_behind {
            *open = false;
        }
    }

    /// Returns whether a wakeup is currently pending.
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_starts_closed() {
        let gate = Gate::new();
        assert!(!gate.is_open());
    }

    #[test]
    fn gate_open_is_idempotent() {
        let gate = Gate::new();
        for _ in 0..5 {
            gate.open();
        }
        // One enter consumes the single pending wakeup.
        gate.enter(true);
        assert!(!gate.is_open());
    }

    #[test]
    fn gate_close_clears_pending_wakeup() {
        let gate = Gate::new();
        gate.open();
        gate.close();
        assert!(!gate.is_open());
    }

    #[test]
    fn gate_enter_without_close_behind_leaves_open() {
        let gate = Gate::new();
        gate.open();
        gate.enter(false);
        assert!(gate.is_open());
        // A second enter goes straight through.
        gate.enter(true);
        assert!(!gate.is_open());
    }

    #[test]
    fn gate_k_opens_wake_exactly_one_waiter() {
        let gate = Arc::new(Gate::new());
        for _ in 0..10 {
            gate.open();
        }

        // First waiter consumes the single wakeup.
        gate.enter(true);

        // A second waiter must block until a fresh open().
        let (tx, rx) = mpsc::channel();
        let gate2 = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            gate2.enter(true);
            tx.send(()).unwrap();
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "waiter woke without a pending wakeup"
        );

        gate.open();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter never woke after open()");
        waiter.join().unwrap();
    }

    #[test]
    fn gate_open_before_enter_is_not_lost() {
        let gate = Arc::new(Gate::new());
        let gate2 = Arc::clone(&gate);

        // Signal first, wait later: the wakeup must still be pending.
        gate.open();
        let waiter = thread::spawn(move || {
            gate2.enter(true);
        });
        waiter.join().unwrap();
        assert!(!gate.is_open());
    }
}

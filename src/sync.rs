//! Synchronization Primitives
//!
//! # Design
//! - `TryLock` is a non-reentrant, non-queueing mutual-exclusion gate:
//!   acquisition either succeeds immediately or fails immediately
//! - Blocking and fairness are deliberately absent; contenders are told
//!   "busy" and decide for themselves

use core::sync::atomic::{AtomicBool, Ordering};

/// A fail-fast mutual-exclusion gate.
///
/// Unlike a mutex, `TryLock` never parks or spins: `try_acquire`
/// returns `false` to the loser of a race. Release is unconditional
/// and must happen exactly once per successful acquire.
#[derive(Debug)]
pub struct TryLock {
    held: AtomicBool,
}

impl TryLock {
    /// Create a new, free lock.
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Attempt to take the lock. Returns `false` without waiting if it
    /// is already held.
    #[inline]
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// Must only be called by the holder, exactly once per successful
    /// `try_acquire`.
    #[inline]
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Check whether the lock is currently held.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl Default for TryLock {
    fn default() -> Self {
        Self::new()
    }
}

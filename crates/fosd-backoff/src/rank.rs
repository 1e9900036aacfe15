//! Rank-checked mutexes for the backoff lock hierarchy.
//!
//! The subsystem has a process-wide total lock order:
//!
//! ```text
//!    Backoff::state        rank 3  (outermost, acquired first)
//!       pg backoff index   rank 2
//!          Session registry  rank 1  (innermost)
//! ```
//!
//! [`RankedMutex`] wraps a [`parking_lot::Mutex`] with a rank tag. In debug
//! builds every acquisition is checked against a thread-local stack of held
//! ranks: a thread may only acquire a lock whose rank is strictly below
//! every rank it already holds. A violation panics immediately, naming the
//! offending lock, instead of surfacing later as a deadlock. Release builds
//! compile the tracking away.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Rank of the session registry lock (innermost).
pub const RANK_SESSION: u8 = 1;
/// Rank of a placement group's backoff-index lock.
pub const RANK_PG_INDEX: u8 = 2;
/// Rank of a backoff's own state lock (outermost).
pub const RANK_BACKOFF: u8 = 3;

#[cfg(debug_assertions)]
thread_local! {
    static HELD_RANKS: std::cell::RefCell<Vec<u8>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// True iff the current thread holds a lock of the given rank.
///
/// Always false in release builds; callers must pair this with
/// `debug_assert!` so the check vanishes along with the tracking.
#[must_use]
pub fn rank_held(rank: u8) -> bool {
    #[cfg(debug_assertions)]
    {
        HELD_RANKS.with(|held| held.borrow().contains(&rank))
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = rank;
        false
    }
}

/// A mutex tagged with its place in the lock hierarchy.
pub struct RankedMutex<T> {
    name: &'static str,
    rank: u8,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    #[must_use]
    pub fn new(name: &'static str, rank: u8, value: T) -> Self {
        Self {
            name,
            rank,
            inner: Mutex::new(value),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn rank(&self) -> u8 {
        self.rank
    }

    /// Acquire the lock, enforcing monotonically decreasing rank.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the current thread already holds a lock of
    /// equal or lower rank.
    pub fn lock(&self) -> RankedGuard<'_, T> {
        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.last() {
                assert!(
                    self.rank < top,
                    "lock order violation: acquiring {} (rank {}) while holding a rank-{top} lock",
                    self.name,
                    self.rank,
                );
            }
            held.push(self.rank);
        });

        RankedGuard {
            inner: self.inner.lock(),
            #[cfg(debug_assertions)]
            rank: self.rank,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RankedMutex");
        d.field("name", &self.name).field("rank", &self.rank);
        match self.inner.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

/// Guard for a [`RankedMutex`]; pops the rank off the held stack on drop.
pub struct RankedGuard<'a, T> {
    inner: MutexGuard<'a, T>,
    #[cfg(debug_assertions)]
    rank: u8,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| {
            let mut held = held.borrow_mut();
            // Guards may be dropped out of LIFO order; remove the last
            // occurrence of this rank rather than blindly popping.
            if let Some(pos) = held.iter().rposition(|&r| r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

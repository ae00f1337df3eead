//! Ranked structure locks.
//!
//! Every structure lock in the IPC layer is a short-held spinlock tagged
//! with a [`Rank`]. Locks must be acquired in strictly increasing rank
//! order, which keeps the dominance order Space → PortSet → Port → MQueue a
//! structural property instead of a convention. Debug builds verify the
//! order on every acquisition with a thread-local hold count per rank.
//!
//! The per-waiter sleep slot ([`crate::wait::WaitSlot`]) is a leaf and is
//! not tracked here.
use core::ops::{Deref, DerefMut};

/// Lock ranks, lowest acquired first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum Rank {
    Space = 0,
    PortSet = 1,
    Port = 2,
    MQueue = 3,
}

#[cfg(debug_assertions)]
mod ranks {
    use super::Rank;
    use std::cell::Cell;

    const NUM_RANKS: usize = 4;

    std::thread_local! {
        static HELD: [Cell<u32>; NUM_RANKS] = Default::default();
    }

    pub fn acquired(rank: Rank) {
        HELD.with(|held| {
            for r in rank as usize..NUM_RANKS {
                assert_eq!(
                    held[r].get(),
                    0,
                    "lock order violation: acquiring {:?} while holding a \
                     lock of rank {}",
                    rank,
                    r,
                );
            }
            held[rank as usize].set(held[rank as usize].get() + 1);
        });
    }

    pub fn released(rank: Rank) {
        HELD.with(|held| {
            let count = held[rank as usize].get();
            debug_assert_ne!(count, 0);
            held[rank as usize].set(count - 1);
        });
    }
}

/// A spinlock whose acquisitions are checked against the rank order.
pub(crate) struct RankedMutex<T: ?Sized> {
    #[cfg(debug_assertions)]
    rank: Rank,
    mutex: spin::Mutex<T>,
}

impl<T> RankedMutex<T> {
    #[cfg_attr(not(debug_assertions), allow(unused_variables))]
    pub fn new(rank: Rank, x: T) -> Self {
        Self {
            #[cfg(debug_assertions)]
            rank,
            mutex: spin::Mutex::new(x),
        }
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        #[cfg(debug_assertions)]
        ranks::acquired(self.rank);
        RankedMutexGuard {
            #[cfg(debug_assertions)]
            rank: self.rank,
            guard: self.mutex.lock(),
        }
    }
}

/// RAII scope for a [`RankedMutex`]. Releasing happens strictly via drop so
/// that no path can leave the structure locked.
pub(crate) struct RankedMutexGuard<'a, T: ?Sized> {
    #[cfg(debug_assertions)]
    rank: Rank,
    guard: spin::MutexGuard<'a, T>,
}

impl<T: ?Sized> Deref for RankedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        ranks::released(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_nesting() {
        let a = RankedMutex::new(Rank::Space, 1u32);
        let b = RankedMutex::new(Rank::MQueue, 2u32);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
    }

    #[test]
    fn sequential_reacquisition() {
        let a = RankedMutex::new(Rank::Port, ());
        drop(a.lock());
        drop(a.lock());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn out_of_order_nesting() {
        let a = RankedMutex::new(Rank::MQueue, ());
        let b = RankedMutex::new(Rank::Space, ());
        let _ga = a.lock();
        let _gb = b.lock();
    }
}

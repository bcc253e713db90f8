/*
 * Counting Barrier
 *
 * Arrivers accumulate under the barrier lock and park on the wait queue
 * until the final arriver flips the generation, resets the count and
 * broadcasts. The generation counter is what sleepers wait on, so the
 * barrier is immediately reusable for the next round.
 */

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::sync::{Spinlock, WaitQueue};

pub struct Barrier {
    lock: Spinlock,
    expected: u32,
    arrived: AtomicU32,
    generation: AtomicU64,
    wq: WaitQueue,
}

impl Barrier {
    /// A barrier released once `expected` threads have arrived.
    pub const fn new(expected: u32) -> Self {
        assert!(expected > 0, "barrier needs at least one participant");
        Self {
            lock: Spinlock::new(),
            expected,
            arrived: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            wq: WaitQueue::new(),
        }
    }

    /// Arrive at the barrier, blocking until all participants have.
    /// Returns true on exactly one arriver per round: the one that
    /// released the others.
    pub fn arrive(&self) -> bool {
        let flags = self.lock.lock_irq_save();
        let generation = self.generation.load(Ordering::Acquire);
        let arrived = self.arrived.load(Ordering::Relaxed) + 1;

        if arrived == self.expected {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.store(generation + 1, Ordering::Release);
            self.wq.wake_all();
            self.lock.unlock_irq_restore(flags);
            return true;
        }

        self.arrived.store(arrived, Ordering::Relaxed);
        self.lock.unlock_irq_restore(flags);

        // A final arriver that beat us to the generation bump is caught
        // by the predicate under the queue lock.
        self.wq
            .sleep_extended(Some(&|| {
                self.generation.load(Ordering::Acquire) != generation
            }));
        false
    }

    /// Number of threads that have arrived in the current round.
    pub fn arrived(&self) -> u32 {
        self.arrived.load(Ordering::Relaxed)
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }
}

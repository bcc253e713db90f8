/*
 * Counting Semaphore
 *
 * A signed count, a guard lock, and a wait queue. The blocking acquire
 * must go through `sleep_extended` with the count predicate: a releaser
 * that runs between the count check and the enqueue is caught by the
 * predicate re-check under the queue lock, so no wakeup is ever lost.
 */

use core::sync::atomic::{AtomicI64, Ordering};

use crate::sync::{Spinlock, WaitQueue};

pub struct Semaphore {
    count: AtomicI64,
    lock: Spinlock,
    wq: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: i64) -> Self {
        Self {
            count: AtomicI64::new(initial),
            lock: Spinlock::new(),
            wq: WaitQueue::new(),
        }
    }

    /// P: block until a unit is available, then take it.
    pub fn acquire(&self) {
        loop {
            let flags = self.lock.lock_irq_save();
            if self.count.load(Ordering::Relaxed) > 0 {
                self.count.fetch_sub(1, Ordering::Relaxed);
                self.lock.unlock_irq_restore(flags);
                return;
            }
            self.lock.unlock_irq_restore(flags);

            // Losing the race against a releaser here is fine: the
            // predicate is re-checked under the queue lock.
            self.wq
                .sleep_extended(Some(&|| self.count.load(Ordering::Acquire) > 0));
        }
    }

    /// Take a unit if one is available, without blocking.
    pub fn try_acquire(&self) -> bool {
        let flags = self.lock.lock_irq_save();
        let taken = self.count.load(Ordering::Relaxed) > 0;
        if taken {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.unlock_irq_restore(flags);
        taken
    }

    /// V: return a unit and wake one waiter. Safe from interrupt
    /// context.
    pub fn release(&self) {
        let flags = self.lock.lock_irq_save();
        self.count.fetch_add(1, Ordering::Release);
        self.wq.wake_one();
        self.lock.unlock_irq_restore(flags);
    }

    /// Current count (diagnostics; immediately stale).
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}

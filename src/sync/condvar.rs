/*
 * Condition Variable
 *
 * A wait queue plus the release-and-sleep protocol: `wait` releases the
 * caller's mutex only after the queue lock is held, so a signaler that
 * holds the same mutex can never slip between the release and the
 * enqueue. The mutex is re-acquired before `wait` returns.
 */

use crate::sync::{Spinlock, WaitQueue};

pub struct CondVar {
    wq: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            wq: WaitQueue::new(),
        }
    }

    /// Release `mutex`, block until signalled, re-acquire `mutex`.
    /// The caller must hold `mutex`. As with any condition variable,
    /// re-check the predicate on return.
    pub fn wait(&self, mutex: &Spinlock) {
        self.wq.sleep_unlocking(None, mutex);
        mutex.lock();
    }

    /// Wake one waiter. Returns whether anybody was waiting. Callers
    /// that want the woken thread to observe a state change must hold
    /// the associated mutex while making it.
    pub fn signal(&self) -> bool {
        self.wq.wake_one()
    }

    /// Wake every waiter. Returns the number woken.
    pub fn broadcast(&self) -> usize {
        self.wq.wake_all()
    }

    /// Number of threads currently blocked in [`wait`].
    pub fn waiter_count(&self) -> usize {
        self.wq.waiter_count()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

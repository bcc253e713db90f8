/*
 * Wait Queue
 *
 * The primitive every blocking operation in the kernel is built on: a
 * FIFO of WAITING threads guarded by a raw spinlock.
 *
 * The sleep protocol, and why its order matters:
 *
 * 1. The sleeper takes the queue lock with interrupts off.
 * 2. It rechecks the caller's condition. A waker that already ran has
 *    either finished waking or not yet taken the lock; either way the
 *    condition check under the lock decides, and a true condition means
 *    "do not queue" (this is the lost-wakeup fast path).
 * 3. Otherwise it stores WAITING, enqueues itself, issues a full fence,
 *    disables preemption, re-enables interrupts, and calls the
 *    scheduler's `sleep`, which releases the queue lock only *after*
 *    the context switch off the sleeper's stack has committed.
 *
 * Because the sleeper holds the lock across the status store and the
 * enqueue, a racing waker cannot miss it; because the scheduler releases
 * the lock after the switch, a waker cannot dequeue a thread that still
 * owns its stack.
 *
 * Wakers (threads or interrupt handlers) take the lock, dequeue, hand
 * each victim to the scheduler's wake path, and kick the victim's CPU.
 * There is no cancellation: a thread leaves a queue by being woken or
 * by being destroyed.
 */

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;

use crate::arch;
use crate::sched;
use crate::sync::Spinlock;
use crate::thread::{Thread, ThreadStatus};

/// FIFO of blocked threads. Sleepers record a back-reference to the
/// queue they are parked on in their TCB.
pub struct WaitQueue {
    lock: Spinlock,
    waiters: UnsafeCell<VecDeque<Arc<Thread>>>,
}

// SAFETY: `waiters` is only touched with `lock` held (or with exclusive
// access in `Drop`).
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            lock: Spinlock::new(),
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// The guard lock itself, for handing to the scheduler contract.
    pub(crate) fn lock_raw(&self) -> &Spinlock {
        &self.lock
    }

    /// # Safety
    ///
    /// The queue lock must be held, or the caller must have exclusive
    /// access to `self`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn waiters_mut(&self) -> &mut VecDeque<Arc<Thread>> {
        unsafe { &mut *self.waiters.get() }
    }

    /// Block the current thread on this queue until a waker releases it.
    pub fn sleep(&self) {
        self.sleep_inner(None, None);
    }

    /// Atomically with respect to wakers: return immediately if `cond`
    /// is already true, otherwise block on this queue. On return, local
    /// interrupts are back at their pre-call level.
    pub fn sleep_extended(&self, cond: Option<&dyn Fn() -> bool>) {
        self.sleep_inner(cond, None);
    }

    /// Like [`WaitQueue::sleep_extended`], additionally releasing
    /// `unlock` once the queue lock is held. This is the
    /// release-and-sleep step of the condition-variable protocol: a
    /// signaler that holds `unlock` cannot slip between the release and
    /// the enqueue.
    pub(crate) fn sleep_unlocking(&self, cond: Option<&dyn Fn() -> bool>, unlock: &Spinlock) {
        self.sleep_inner(cond, Some(unlock));
    }

    fn sleep_inner(&self, cond: Option<&dyn Fn() -> bool>, unlock: Option<&Spinlock>) {
        debug_assert!(
            !arch::in_interrupt_context(),
            "sleep on a wait queue from interrupt context"
        );

        let t = crate::thread::current();
        log::debug!("{} going to sleep on queue {:p}", t.id(), self);

        let flags = self.lock.lock_irq_save();

        if let Some(user_lock) = unlock {
            user_lock.unlock();
        }

        if let Some(cond) = cond {
            if cond() {
                // The state we would wait for is already there; the
                // waker is either done or has not started, and in both
                // cases queueing now would risk sleeping forever.
                self.lock.unlock_irq_restore(flags);
                log::debug!("{} fast wakeup, condition already met", t.id());
                return;
            }
        }

        t.set_status(ThreadStatus::Waiting);
        t.set_wait_marker(self);
        // SAFETY: queue lock held.
        unsafe { self.waiters_mut().push_back(t.clone()) };

        // Status store and enqueue must be globally visible before the
        // switch can commit.
        arch::fence();

        // A preempting tick must not reschedule us while the stack is
        // half-prepared for suspension; interrupts themselves can come
        // back on, wakers will simply spin on the queue lock until the
        // scheduler releases it on the far side of the switch.
        sched::preempt_disable();
        arch::irq_restore(flags);

        drop(t);
        sched::ops().sleep(&self.lock);

        log::debug!("slow wakeup from queue {:p}", self);
        // No unlock here: the scheduler released the queue lock for us.
    }

    /// Wake the thread at the head of the queue, if any. Safe from
    /// interrupt context. Returns whether a thread was woken.
    pub fn wake_one(&self) -> bool {
        let flags = self.lock.lock_irq_save();
        // SAFETY: queue lock held.
        let woken = match unsafe { self.waiters_mut().pop_front() } {
            None => false,
            Some(t) => {
                self.wake_thread(t);
                true
            }
        };
        self.lock.unlock_irq_restore(flags);
        woken
    }

    /// Wake every thread on the queue. Safe from interrupt context.
    /// Returns the number of threads woken; zero on an empty queue.
    pub fn wake_all(&self) -> usize {
        let flags = self.lock.lock_irq_save();
        let woken = self.wake_all_inner();
        self.lock.unlock_irq_restore(flags);
        woken
    }

    /// Wake-all for callers that already hold the queue lock (the exit
    /// path locks its own joiner queue before publishing EXITED).
    pub(crate) fn wake_all_locked(&self) -> usize {
        self.wake_all_inner()
    }

    fn wake_all_inner(&self) -> usize {
        let mut woken = 0;
        // SAFETY: queue lock held by both callers.
        while let Some(t) = unsafe { self.waiters_mut().pop_front() } {
            self.wake_thread(t);
            woken += 1;
        }
        woken
    }

    /// Hand one dequeued sleeper to the scheduler's wake path. Queue
    /// lock is held.
    fn wake_thread(&self, t: Arc<Thread>) {
        t.clear_wait_marker();
        if t.status() != ThreadStatus::Waiting {
            // Somebody mutated a queued thread behind the lock. Warn
            // and keep draining rather than wedging the waker.
            log::warn!("queued thread {} has status {}", t.id(), t.status());
        }
        let cpu = t.current_cpu();
        if let Err(e) = sched::ops().awaken(&t, cpu) {
            log::error!("failed to awaken {}: {e}", t.id());
            return;
        }
        sched::ops().kick_cpu(cpu);
        log::debug!("woke {} on cpu {}", t.id(), cpu);
    }

    /// Remove a specific thread from the queue (destroy's defensive
    /// path). The thread is not woken.
    pub(crate) fn remove(&self, t: &Arc<Thread>) {
        let flags = self.lock.lock_irq_save();
        // SAFETY: queue lock held.
        unsafe { self.waiters_mut().retain(|w| !Arc::ptr_eq(w, t)) };
        self.lock.unlock_irq_restore(flags);
    }

    /// Drop all entries without waking anyone.
    pub(crate) fn clear(&self) {
        let flags = self.lock.lock_irq_save();
        // SAFETY: queue lock held.
        unsafe { self.waiters_mut().clear() };
        self.lock.unlock_irq_restore(flags);
    }

    pub fn is_empty(&self) -> bool {
        self.waiter_count() == 0
    }

    /// Number of threads currently parked on the queue.
    pub fn waiter_count(&self) -> usize {
        let flags = self.lock.lock_irq_save();
        // SAFETY: queue lock held.
        let n = unsafe { self.waiters_mut().len() };
        self.lock.unlock_irq_restore(flags);
        n
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // Destroying a queue does not destroy the threads on it, only
        // their entries; a populated queue at this point means a waker
        // was owed.
        let waiters = self.waiters.get_mut();
        if !waiters.is_empty() {
            log::warn!("wait queue destroyed with {} waiters", waiters.len());
            waiters.clear();
        }
    }
}

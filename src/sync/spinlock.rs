/*
 * Raw Spinlock
 *
 * Test-and-set spinlock with a pause hint. Deliberately *raw*: `lock`
 * and `unlock` are separate calls with no guard object, because the
 * scheduler contract releases a sleeper's queue lock on the far side of
 * a context switch, long after the acquiring frame is gone. Guarded
 * globals that never cross a context switch use `spin::Mutex` instead.
 *
 * Locking rule: any lock that is also taken from interrupt context must
 * be acquired with `lock_irq_save` only. Taking such a lock with
 * interrupts enabled deadlocks the CPU when the interrupt re-enters the
 * holder.
 */

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, IrqFlags};

/// One-word test-and-set mutex. Spins, never yields.
#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning with a pause hint until it is free.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch::cpu_relax();
            }
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock. The caller must hold it.
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of a free spinlock");
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire with local interrupts disabled, returning the saved
    /// interrupt-enable state for the matching [`unlock_irq_restore`].
    pub fn lock_irq_save(&self) -> IrqFlags {
        let flags = arch::irq_save();
        self.lock();
        flags
    }

    /// Release and conditionally re-enable local interrupts.
    pub fn unlock_irq_restore(&self, flags: IrqFlags) {
        self.unlock();
        arch::irq_restore(flags);
    }

    /// Whether the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

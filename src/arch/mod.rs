/*
 * CPU Layer
 *
 * The instruction-level collaborators of the thread core: the local
 * interrupt gate, the full memory fence, the spin pause hint, CPU
 * identity, and the per-CPU interrupt-nesting counter that answers
 * "am I in interrupt context?".
 *
 * Two implementations exist:
 * - `x86_64`: real instructions, selected for bare-metal x86_64 builds.
 * - `hosted`: an emulated interrupt flag for every other target, so the
 *   synchronization protocols run unchanged under the hosted test port.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::params::MAX_CPUS;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64 as imp;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hosted;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
use hosted as imp;

pub use imp::{halt, irq_restore, irq_save, irqs_enabled, my_cpu_id};

/// Saved local interrupt-enable state, produced by [`irq_save`] and
/// consumed by [`irq_restore`].
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags {
    pub(crate) enabled: bool,
}

impl IrqFlags {
    /// Whether interrupts were enabled at the time of the save.
    pub fn were_enabled(&self) -> bool {
        self.enabled
    }
}

/// Full memory fence. This is the ordering point of the sleep and exit
/// protocols: status stores and queue links become visible to other CPUs
/// before the scheduler is invited to switch.
#[inline]
pub fn fence() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Pause hint for spin loops.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Number of CPUs the system runs on. Installed once at `init`.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

pub(crate) fn set_cpu_count(count: u32) {
    assert!(count >= 1 && count as usize <= MAX_CPUS, "bad CPU count");
    CPU_COUNT.store(count, Ordering::Release);
}

/// Number of CPUs in the system.
#[inline]
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Per-CPU interrupt-nesting depth. Platform interrupt entry/exit stubs
/// bracket handlers with `irq_enter`/`irq_exit`.
static IRQ_DEPTH: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Note entry into an interrupt handler on the current CPU.
#[inline]
pub fn irq_enter() {
    IRQ_DEPTH[my_cpu_id() as usize % MAX_CPUS].fetch_add(1, Ordering::Relaxed);
}

/// Note exit from an interrupt handler on the current CPU.
#[inline]
pub fn irq_exit() {
    IRQ_DEPTH[my_cpu_id() as usize % MAX_CPUS].fetch_sub(1, Ordering::Relaxed);
}

/// Whether the current CPU is executing in interrupt context.
/// Interrupt context may wake sleepers but must never sleep.
#[inline]
pub fn in_interrupt_context() -> bool {
    IRQ_DEPTH[my_cpu_id() as usize % MAX_CPUS].load(Ordering::Relaxed) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_save_restore_round_trips() {
        let flags = irq_save();
        // Nested save observes interrupts disabled.
        let inner = irq_save();
        assert!(!inner.were_enabled());
        irq_restore(inner);
        irq_restore(flags);
        assert_eq!(irqs_enabled(), flags.were_enabled());
    }

    #[test]
    fn interrupt_nesting_tracks_depth() {
        assert!(!in_interrupt_context());
        irq_enter();
        assert!(in_interrupt_context());
        irq_enter();
        irq_exit();
        assert!(in_interrupt_context());
        irq_exit();
        assert!(!in_interrupt_context());
    }
}

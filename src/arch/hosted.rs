/*
 * Hosted CPU Layer
 *
 * Fallback implementation for targets with an operating system under us
 * (library builds on a host, the test port). There is no hardware
 * interrupt flag to manipulate, so one is emulated; the synchronization
 * protocols above this layer are identical to the bare-metal build.
 *
 * Under `cfg(test)` the emulated flag is thread-local so concurrently
 * running unit tests observe their own gate. Outside of tests a single
 * process-wide flag suffices.
 */

use super::IrqFlags;

#[cfg(not(test))]
mod flag {
    use core::sync::atomic::{AtomicBool, Ordering};

    static IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn get() -> bool {
        IRQ_ENABLED.load(Ordering::Relaxed)
    }

    pub fn set(enabled: bool) {
        IRQ_ENABLED.store(enabled, Ordering::Relaxed);
    }
}


/// Save the emulated interrupt-enable flag and leave interrupts disabled.
pub fn irq_save() -> IrqFlags {
    let enabled = flag::get();
    flag::set(false);
    IrqFlags { enabled }
}

/// Restore the emulated interrupt-enable flag to its saved state.
pub fn irq_restore(flags: IrqFlags) {
    if flags.enabled {
        flag::set(true);
    }
}

/// Whether emulated interrupts are currently enabled.
pub fn irqs_enabled() -> bool {
    flag::get()
}

/// There is no CPU to halt on a hosted target; pause instead.
pub fn halt() {
    core::hint::spin_loop();
}

/// Hosted builds model a single logical CPU.
pub fn my_cpu_id() -> u32 {
    0
}

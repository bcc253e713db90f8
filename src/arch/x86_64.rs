/*
 * x86_64 CPU Layer
 *
 * Bare-metal implementation of the interrupt gate and CPU identity.
 * Interrupt-flag handling goes through the `x86_64` crate; CPU identity
 * is the local APIC ID from CPUID leaf 1.
 */

use x86_64::instructions::interrupts;

use super::IrqFlags;

/// Save RFLAGS.IF and disable local interrupts.
pub fn irq_save() -> IrqFlags {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    IrqFlags { enabled }
}

/// Conditionally re-enable local interrupts: only if they were enabled
/// at the matching [`irq_save`].
pub fn irq_restore(flags: IrqFlags) {
    if flags.enabled {
        interrupts::enable();
    }
}

/// Whether local interrupts are currently enabled.
pub fn irqs_enabled() -> bool {
    interrupts::are_enabled()
}

/// Halt the CPU until the next interrupt.
pub fn halt() {
    x86_64::instructions::hlt();
}

/// Local APIC ID of the executing CPU (CPUID leaf 1, EBX[31:24]).
pub fn my_cpu_id() -> u32 {
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ebx >> 24
}

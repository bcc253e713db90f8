/*
 * Scheduler Contract
 *
 * The thread core does not schedule anything itself. It consumes a fixed
 * set of entry points from whatever scheduler the system embeds, and
 * trusts their contracts. Policy (EDF, round-robin, priorities) lives
 * entirely behind this trait.
 *
 * The hard contracts, on which the sleep and exit protocols depend:
 *
 * - `sleep(lock)`: the caller is WAITING and enqueued on a wait queue
 *   whose guard `lock` it holds. The scheduler releases `lock` only
 *   *after* the context switch off the caller's stack has committed, and
 *   re-enables preemption on the way out.
 * - `exit(lock)`: same release rule, but the caller is EXITED and must
 *   never be resumed. `pre_destroy` must not return until the thread is
 *   off-CPU everywhere, so its stack can be reclaimed.
 * - `awaken(t, cpu)`: transitions t from WAITING to RUNNABLE and inserts
 *   it into `cpu`'s runqueue; a following `kick_cpu` makes the CPU
 *   reconsider.
 */

use alloc::{boxed::Box, sync::Arc};
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::error::Result;
use crate::params::MAX_CPUS;
use crate::sync::Spinlock;
use crate::thread::Thread;

/// CPU binding wildcard: the thread may run on any CPU.
pub const CPU_ANY: i32 = -1;

/// Per-thread state owned by the scheduler and carried opaquely by the
/// TCB. The scheduler downcasts it back on its side of the boundary.
pub type SchedHook = Box<dyn Any + Send + Sync>;

/// The entry points the thread core consumes from the embedded scheduler.
pub trait SchedOps: Send + Sync {
    /// Allocate per-thread scheduler state for a new TCB. `is_boot` marks
    /// the bootstrap thread adopted at bring-up. `None` means the
    /// scheduler has no free hook for this thread.
    fn thread_state_init(&self, thread: &Thread, is_boot: bool) -> Option<SchedHook>;

    /// Release whatever `thread_state_init` allocated. The hook itself is
    /// dropped by the core after this returns.
    fn thread_state_deinit(&self, thread: &Thread);

    /// Admission control, called once after the TCB is fully built.
    fn post_create(&self, thread: &Arc<Thread>) -> Result<()>;

    /// Called before the core tears a TCB down. Must not return until the
    /// thread is fully descheduled on every CPU.
    fn pre_destroy(&self, thread: &Thread);

    /// Insert a RUNNABLE thread into `cpu`'s runqueue (`CPU_ANY` lets the
    /// scheduler place it). `immediate` hints that it should run soon.
    fn make_runnable(&self, thread: &Arc<Thread>, cpu: i32, immediate: bool) -> Result<()>;

    /// Wake path: transition `thread` WAITING -> RUNNABLE on `cpu`.
    fn awaken(&self, thread: &Arc<Thread>, cpu: u32) -> Result<()>;

    /// Deschedule the caller, which is WAITING and enqueued. Releases
    /// `queue_lock` after the switch; re-enables preemption.
    fn sleep(&self, queue_lock: &Spinlock);

    /// Deschedule the caller permanently. Releases `queue_lock` after the
    /// switch. Never returns.
    fn exit(&self, queue_lock: &Spinlock) -> !;

    /// Voluntary reschedule. The caller holds its own TCB lock, which is
    /// released after the switch.
    fn yield_now(&self, tcb_lock: &Spinlock);

    /// Deliver an IPI making `cpu` reconsider its runqueue.
    fn kick_cpu(&self, cpu: u32);

    /// Apply `f` to every live TCB on `cpu`, or on all CPUs for
    /// [`CPU_ANY`].
    fn map_threads(&self, cpu: i32, f: &mut dyn FnMut(&Arc<Thread>));

    /// The thread currently executing on this CPU. O(1) via per-CPU
    /// state the scheduler maintains.
    fn current_thread(&self) -> Arc<Thread>;
}

/// The installed scheduler. Written at `init` (and again by test
/// harnesses that tear the core down and back up); read on every hot
/// path, so reads copy the reference out and drop the guard immediately.
static SCHED: spin::RwLock<Option<&'static dyn SchedOps>> = spin::RwLock::new(None);

/// Install the scheduler the core cooperates with.
pub fn install(ops: &'static dyn SchedOps) {
    *SCHED.write() = Some(ops);
    log::info!("scheduler interface installed");
}

/// Remove the installed scheduler. Part of explicit teardown; any thread
/// operation after this panics.
pub fn uninstall() {
    *SCHED.write() = None;
}

/// Whether a scheduler has been installed.
pub fn installed() -> bool {
    SCHED.read().is_some()
}

/// The installed scheduler interface.
///
/// # Panics
///
/// Panics if called before [`install`]: the thread core cannot operate
/// without its scheduler, and the blocking paths that land here have no
/// way to report an error.
pub fn ops() -> &'static dyn SchedOps {
    SCHED
        .read()
        .expect("thread core used before a scheduler was installed")
}

/// Per-CPU preemption-disable depth. The sleep protocol disables
/// preemption before re-enabling interrupts so a preempting tick cannot
/// switch away a thread whose stack is half-prepared for suspension.
/// The scheduler re-enables on its side of the switch.
static PREEMPT_DEPTH: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Disable preemption on the current CPU. Nests.
#[inline]
pub fn preempt_disable() {
    PREEMPT_DEPTH[arch::my_cpu_id() as usize % MAX_CPUS].fetch_add(1, Ordering::AcqRel);
}

/// Re-enable preemption on the current CPU.
#[inline]
pub fn preempt_enable() {
    let prev = PREEMPT_DEPTH[arch::my_cpu_id() as usize % MAX_CPUS].fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "unbalanced preempt_enable");
}

/// Whether preemption is currently disabled on the given CPU. Embedding
/// schedulers consult this from their tick handler.
#[inline]
pub fn preempt_disabled(cpu: u32) -> bool {
    PREEMPT_DEPTH[cpu as usize % MAX_CPUS].load(Ordering::Acquire) > 0
}

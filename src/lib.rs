/*
 * kthreads - kernel thread and synchronization core
 *
 * The lifecycle of kernel threads, the wait-queue primitive every
 * blocking operation is built on, the scheduler-cooperation contract
 * that keeps blocking correct under preemption and interrupts, and the
 * thread-local storage threaded through all of it. Condition variables,
 * semaphores and barriers are thin compositions over the same core.
 *
 * The scheduler itself is *consumed*, not implemented: an embedder
 * installs a `sched::SchedOps` implementation at `init`, and the core
 * only ever calls the fixed set of entry points that trait names.
 *
 * All state lives in RAM; there is no persistence. The crate is
 * `no_std` + `alloc`; a heap allocator is assumed (bare-metal embedders
 * can enable the `boot-heap` feature for one).
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
#[cfg(feature = "boot-heap")]
pub mod heap;
pub mod params;
pub mod sched;
pub mod shell;
pub mod sync;
pub mod thread;

pub use error::{Result, ThreadError};
pub use sched::{CPU_ANY, SchedOps};
pub use sync::{Barrier, CondVar, Semaphore, Spinlock, WaitQueue};
pub use thread::{
    EntryFn, Thread, ThreadFlags, ThreadId, ThreadStatus, reaper::ReapPolicy, tls,
};

/// Bring the thread core up: record the CPU count, select the reap
/// policy, and install the scheduler interface. Call once at boot,
/// before any thread operation. Test harnesses may call it again after
/// [`shutdown`].
pub fn init(sched: &'static dyn SchedOps, num_cpus: u32, reap: ReapPolicy) {
    arch::set_cpu_count(num_cpus);
    thread::reaper::set_policy(reap);
    sched::install(sched);
    log::info!("thread core up: {num_cpus} cpu(s), reap policy {reap:?}");
}

/// Tear the thread core down: reap outstanding zombies and drop the
/// scheduler interface.
pub fn shutdown() {
    let reaped = thread::reaper::reap_pending();
    if reaped > 0 {
        log::info!("reaped {reaped} threads at shutdown");
    }
    sched::uninstall();
}

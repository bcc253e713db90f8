/*
 * Reaper
 *
 * What happens when a thread's protocol refcount reaches zero is a
 * policy choice: destroy the TCB on the spot, or park it on a zombie
 * queue that a reaper thread (or any maintenance path) drains in
 * batches. Both are supported; `init` selects one.
 *
 * One case is never immediate regardless of policy: a detached thread
 * that drops its own last reference on the exit path is still running
 * on the stack that destroy would free, so it always goes through the
 * zombie queue.
 */

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::thread::{self, Thread};

/// Destruction policy for threads whose refcount reached zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapPolicy {
    /// Destroy in the context that dropped the last reference.
    Immediate,
    /// Park zombies; an embedder-driven sweep destroys them later.
    Deferred,
}

static POLICY: AtomicU8 = AtomicU8::new(0);

/// Threads whose refcount reached zero but which have not been
/// destroyed yet.
static ZOMBIES: spin::Mutex<VecDeque<Arc<Thread>>> = spin::Mutex::new(VecDeque::new());

pub(crate) fn set_policy(policy: ReapPolicy) {
    POLICY.store(policy as u8, Ordering::Release);
}

/// The active reap policy.
pub fn policy() -> ReapPolicy {
    match POLICY.load(Ordering::Acquire) {
        0 => ReapPolicy::Immediate,
        _ => ReapPolicy::Deferred,
    }
}

/// A thread's protocol refcount just hit zero. `from_exit` marks the
/// self-reference drop on the thread's own exit path.
pub(crate) fn on_refcount_zero(t: Arc<Thread>, from_exit: bool) {
    if from_exit || policy() == ReapPolicy::Deferred {
        log::debug!("parking zombie {}", t.id());
        ZOMBIES.lock().push_back(t);
    } else if let Err(e) = thread::destroy(t) {
        log::warn!("immediate reap failed: {e}");
    }
}

/// Destroy every parked zombie. Returns how many threads were reaped.
/// Call from a dedicated reaper thread, or from any convenient
/// maintenance point.
pub fn reap_pending() -> usize {
    let mut reaped = 0;
    loop {
        let Some(t) = ZOMBIES.lock().pop_front() else {
            break;
        };
        let id = t.id();
        match thread::destroy(t) {
            Ok(()) => reaped += 1,
            Err(e) => log::warn!("could not reap {id}: {e}"),
        }
    }
    if reaped > 0 {
        log::debug!("reaped {reaped} threads");
    }
    reaped
}

/// Number of zombies currently awaiting destruction.
pub fn pending() -> usize {
    ZOMBIES.lock().len()
}

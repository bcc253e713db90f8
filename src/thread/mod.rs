/*
 * Thread Lifecycle
 *
 * The per-thread control block (TCB) and every lifecycle operation:
 * create, start, spawn, join, join_all_children, exit, destroy, yield,
 * plus the fork support pieces. The scheduler is consumed through the
 * contract in `crate::sched`; blocking is built on `crate::sync`'s wait
 * queue.
 *
 * Ownership model: a TCB lives inside an `Arc`. The `refcount` field is
 * the *protocol* reference count from the lifecycle rules (a joinable
 * thread starts at 2: one self-reference dropped at exit, one parent
 * reference dropped at join). When it reaches zero the TCB is torn down
 * through the reap policy; the memory itself goes away with the last
 * `Arc`.
 *
 * Lock ordering: a wait-queue lock may be held while taking a TCB-side
 * lock, never the reverse.
 */

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::arch;
use crate::error::{Result, ThreadError};
use crate::params::{DEFAULT_STACK_SIZE, MAX_NAME_LEN, TLS_MAX_KEYS};
use crate::sched::{self, CPU_ANY, SchedHook};
use crate::sync::{Spinlock, WaitQueue};

pub mod reaper;
pub mod stack;
pub mod tls;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use stack::fork_current;
use stack::StackMem;

/// Signature of a thread entry function: one opaque word in, one opaque
/// word out. The returned word becomes the thread's output, as if the
/// thread had called [`exit`] with it.
pub type EntryFn = fn(usize) -> usize;

/// Monotonically-assigned thread identifier, unique per live thread.
/// `ThreadId::NONE` (zero) is never assigned; `fork_current` returns it
/// on the child's logical return.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub const NONE: ThreadId = ThreadId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread status. Transitions form a DAG:
/// INIT -> RUNNABLE <-> RUNNING <-> WAITING, any -> EXITED -> REAPED.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Init = 0,
    Runnable = 1,
    Running = 2,
    Waiting = 3,
    Exited = 4,
    Reaped = 5,
}

impl ThreadStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Waiting,
            4 => Self::Exited,
            5 => Self::Reaped,
            _ => unreachable!("corrupt thread status"),
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: ThreadStatus) -> bool {
        use ThreadStatus::*;
        match (self, to) {
            (Init, Runnable) => true,
            (Runnable, Running) => true,
            (Running, Runnable) => true,
            (Running, Waiting) => true,
            (Waiting, Runnable) => true,
            (_, Exited) => !matches!(self, Exited | Reaped),
            (Exited, Reaped) => true,
            // Destroying a never-started thread skips EXITED.
            (Init, Reaped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Exited => "exited",
            Self::Reaped => "reaped",
        };
        f.pad(s)
    }
}

bitflags! {
    /// Per-thread creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// The thread's lifetime is decoupled from its parent: nobody
        /// joins it and it is reaped as soon as it exits.
        const DETACHED = 1 << 0;
    }
}

#[cfg(feature = "fpu-save")]
#[repr(C, align(16))]
pub(crate) struct FpuArea(pub(crate) core::cell::UnsafeCell<[u8; 512]>);

#[cfg(feature = "fpu-save")]
unsafe impl Send for FpuArea {}
#[cfg(feature = "fpu-save")]
unsafe impl Sync for FpuArea {}

/// Next thread id to hand out. Ids start at 1; 0 is the fork sentinel.
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Per-thread control block.
pub struct Thread {
    id: ThreadId,
    name: spin::Mutex<String>,
    status: AtomicU8,
    stack: StackMem,
    /// Saved stack pointer while not running.
    rsp: AtomicU64,
    entry: Option<EntryFn>,
    input: usize,
    output: AtomicUsize,
    flags: ThreadFlags,
    parent: Weak<Thread>,
    /// Live, joinable children created by this thread.
    children: spin::Mutex<Vec<Arc<Thread>>>,
    /// The wait queue this thread is currently parked on, if any.
    wait_on: AtomicPtr<WaitQueue>,
    /// Queue of threads waiting for this thread to exit.
    pub(crate) joinq: Arc<WaitQueue>,
    /// Per-thread TLS value table, indexed by TLS key.
    pub(crate) tls: [AtomicUsize; TLS_MAX_KEYS],
    /// Protocol reference count; see the module header.
    pub(crate) refcount: AtomicUsize,
    bound_cpu: i32,
    current_cpu: AtomicU32,
    sched_hook: spin::Mutex<Option<SchedHook>>,
    /// Per-TCB lock, held across voluntary yields and name updates.
    pub(crate) lock: Spinlock,
    #[cfg(feature = "fpu-save")]
    pub(crate) fpu: FpuArea,
}

impl Thread {
    fn build(
        entry: Option<EntryFn>,
        input: usize,
        flags: ThreadFlags,
        stack: StackMem,
        bound_cpu: i32,
        parent: Weak<Thread>,
        status: ThreadStatus,
    ) -> Arc<Thread> {
        let rsp = stack.initial_rsp();
        Arc::new(Thread {
            id: ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed)),
            name: spin::Mutex::new(String::new()),
            status: AtomicU8::new(status as u8),
            stack,
            rsp: AtomicU64::new(rsp),
            entry,
            input,
            output: AtomicUsize::new(0),
            flags,
            parent,
            children: spin::Mutex::new(Vec::new()),
            wait_on: AtomicPtr::new(core::ptr::null_mut()),
            joinq: Arc::new(WaitQueue::new()),
            tls: [const { AtomicUsize::new(0) }; TLS_MAX_KEYS],
            refcount: AtomicUsize::new(if flags.contains(ThreadFlags::DETACHED) {
                1
            } else {
                2
            }),
            bound_cpu,
            current_cpu: AtomicU32::new(if bound_cpu >= 0 {
                bound_cpu as u32
            } else {
                arch::my_cpu_id()
            }),
            sched_hook: spin::Mutex::new(None),
            lock: Spinlock::new(),
            #[cfg(feature = "fpu-save")]
            fpu: FpuArea(core::cell::UnsafeCell::new([0; 512])),
        })
    }

    /// Adopt the currently-executing context (boot path, test harnesses)
    /// as a thread. The TCB owns no stack and has no entry function; it
    /// is already RUNNING. The embedder registers it with its scheduler.
    pub fn bootstrap(name: &str) -> Arc<Thread> {
        let t = Self::build(
            None,
            0,
            ThreadFlags::DETACHED,
            StackMem::adopted(),
            CPU_ANY,
            Weak::new(),
            ThreadStatus::Running,
        );
        t.set_name(name);
        t
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Human-readable name, possibly empty.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Set the thread name, truncating to `MAX_NAME_LEN` bytes on a
    /// character boundary.
    pub fn set_name(&self, name: &str) {
        let mut end = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut guard = self.name.lock();
        guard.clear();
        guard.push_str(&name[..end]);
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Store a new status. Schedulers drive RUNNABLE <-> RUNNING and
    /// WAITING -> RUNNABLE; the core drives the rest.
    pub fn set_status(&self, status: ThreadStatus) {
        debug_assert!(
            self.status().can_transition(status),
            "illegal status transition {} -> {}",
            self.status(),
            status
        );
        self.status.store(status as u8, Ordering::Release);
    }

    /// Raw status store used to roll back a failed publish.
    pub(crate) fn set_status_force(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn output(&self) -> usize {
        self.output.load(Ordering::Acquire)
    }

    pub(crate) fn set_output(&self, output: usize) {
        self.output.store(output, Ordering::Release);
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn is_detached(&self) -> bool {
        self.flags.contains(ThreadFlags::DETACHED)
    }

    /// The thread that created this one, while it is still alive.
    pub fn parent(&self) -> Option<Arc<Thread>> {
        self.parent.upgrade()
    }

    /// Protocol reference count (diagnostics).
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn bound_cpu(&self) -> i32 {
        self.bound_cpu
    }

    /// CPU the thread last ran on (or was placed on).
    pub fn current_cpu(&self) -> u32 {
        self.current_cpu.load(Ordering::Acquire)
    }

    /// Schedulers record placement here on dispatch and wake.
    pub fn set_current_cpu(&self, cpu: u32) {
        self.current_cpu.store(cpu, Ordering::Release);
    }

    pub fn entry(&self) -> Option<EntryFn> {
        self.entry
    }

    pub fn input(&self) -> usize {
        self.input
    }

    /// Saved stack pointer while descheduled.
    pub fn saved_rsp(&self) -> u64 {
        self.rsp.load(Ordering::Acquire)
    }

    pub(crate) fn set_saved_rsp(&self, rsp: u64) {
        self.rsp.store(rsp, Ordering::Release);
    }

    pub(crate) fn stack(&self) -> &StackMem {
        &self.stack
    }

    /// Run `f` with the scheduler's opaque per-thread state, if any.
    pub fn with_sched_hook<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R) -> R {
        let guard = self.sched_hook.lock();
        f(guard.as_deref())
    }

    pub(crate) fn install_sched_hook(&self, hook: SchedHook) {
        *self.sched_hook.lock() = Some(hook);
    }

    pub(crate) fn clear_sched_hook(&self) {
        *self.sched_hook.lock() = None;
    }

    /// Record the wait queue this thread is parking on. Called with that
    /// queue's lock held.
    pub(crate) fn set_wait_marker(&self, q: &WaitQueue) {
        let prev = self
            .wait_on
            .swap(q as *const WaitQueue as *mut WaitQueue, Ordering::AcqRel);
        debug_assert!(
            prev.is_null(),
            "thread {} is already on a wait queue",
            self.id
        );
    }

    /// Clear the queue-membership marker. Called with the owning queue's
    /// lock held, or during teardown when no waker can race.
    pub(crate) fn clear_wait_marker(&self) {
        self.wait_on.store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Take the queue this thread still appears to be parked on.
    pub(crate) fn take_wait_marker(&self) -> Option<*const WaitQueue> {
        let q = self.wait_on.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if q.is_null() { None } else { Some(q as *const WaitQueue) }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &*self.name.lock())
            .field("status", &self.status())
            .field("stack_size", &self.stack.size())
            .field("refcount", &self.refcount())
            .field("bound_cpu", &self.bound_cpu)
            .finish()
    }
}

/// The thread currently executing on this CPU.
pub fn current() -> Arc<Thread> {
    sched::ops().current_thread()
}

/// The parent of the current thread, if it is still alive.
pub fn current_parent() -> Option<Arc<Thread>> {
    current().parent()
}

/// Create a thread in INIT state. It is not runnable until [`start`].
///
/// `stack_size == 0` selects the default stack size. `bound_cpu` is a
/// CPU index or [`CPU_ANY`]; an index past the CPU count is rejected.
pub fn create(
    entry: EntryFn,
    input: usize,
    flags: ThreadFlags,
    stack_size: usize,
    bound_cpu: i32,
) -> Result<Arc<Thread>> {
    create_inner(Some(entry), input, flags, stack_size, bound_cpu)
}

pub(crate) fn create_inner(
    entry: Option<EntryFn>,
    input: usize,
    flags: ThreadFlags,
    stack_size: usize,
    bound_cpu: i32,
) -> Result<Arc<Thread>> {
    if bound_cpu != CPU_ANY && (bound_cpu < 0 || bound_cpu as u32 >= arch::cpu_count()) {
        log::error!("impossible CPU binding {bound_cpu}");
        return Err(ThreadError::InvalidArgument);
    }

    let size = if stack_size == 0 {
        DEFAULT_STACK_SIZE
    } else {
        stack_size
    };
    let stack = StackMem::alloc(size)?;

    let parent = current();
    let t = Thread::build(
        entry,
        input,
        flags,
        stack,
        bound_cpu,
        Arc::downgrade(&parent),
        ThreadStatus::Init,
    );

    let Some(hook) = sched::ops().thread_state_init(&t, false) else {
        log::error!("scheduler has no state for new thread");
        return Err(ThreadError::ResourceExhausted);
    };
    t.install_sched_hook(hook);

    // Only joinable children are tracked in the parent's child set; a
    // detached thread's lifetime is its own.
    if !t.is_detached() {
        parent.children.lock().push(t.clone());
    }

    if let Err(e) = sched::ops().post_create(&t) {
        log::error!("scheduler does not accept thread creation: {e}");
        if !t.is_detached() {
            parent.children.lock().retain(|c| !Arc::ptr_eq(c, &t));
        }
        sched::ops().thread_state_deinit(&t);
        t.clear_sched_hook();
        return Err(ThreadError::SchedulerRejected);
    }

    log::debug!("created {} (parent {})", t.id(), parent.id());
    Ok(t)
}

/// Publish an INIT thread: build its initial stack image and hand it to
/// the scheduler's runqueue, then kick the target CPU.
pub fn start(t: &Arc<Thread>) -> Result<()> {
    if t.status() != ThreadStatus::Init {
        return Err(ThreadError::InvalidState);
    }

    stack::setup_init_stack(t, t.entry().is_some(), t.input());

    t.set_status(ThreadStatus::Runnable);
    if let Err(e) = sched::ops().make_runnable(t, t.bound_cpu(), true) {
        log::error!("scheduler failed to run {} on cpu {}: {e}", t.id(), t.current_cpu());
        t.set_status_force(ThreadStatus::Init);
        return Err(ThreadError::SchedulerRejected);
    }
    sched::ops().kick_cpu(t.current_cpu());
    Ok(())
}

/// Create and immediately start a thread.
pub fn spawn(
    entry: EntryFn,
    input: usize,
    flags: ThreadFlags,
    stack_size: usize,
    bound_cpu: i32,
) -> Result<Arc<Thread>> {
    let t = create(entry, input, flags, stack_size, bound_cpu)?;
    start(&t)?;
    Ok(t)
}

/// Remove a child from the parent's set and drop the parent reference.
fn detach(parent: &Arc<Thread>, t: &Arc<Thread>) {
    sched::preempt_disable();
    parent.children.lock().retain(|c| !Arc::ptr_eq(c, t));
    let prev = t.refcount.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "refcount underflow on {}", t.id());
    sched::preempt_enable();
    if prev == 1 {
        reaper::on_refcount_zero(t.clone(), false);
    }
}

/// Wait for a child thread to exit and collect its output.
///
/// Legal only for the thread's parent, and only for a joinable child
/// still in the parent's child set. A join on a thread that already
/// exited returns immediately with the stored output.
pub fn join(t: &Arc<Thread>) -> Result<usize> {
    let me = current();

    let parent = t.parent().ok_or(ThreadError::InvalidState)?;
    if !Arc::ptr_eq(&parent, &me) || t.is_detached() {
        return Err(ThreadError::InvalidState);
    }
    if !me.children.lock().iter().any(|c| Arc::ptr_eq(c, t)) {
        // Already joined, or never ours.
        return Err(ThreadError::InvalidState);
    }

    log::debug!("{} joining {}", me.id(), t.id());
    t.joinq
        .sleep_extended(Some(&|| t.status() == ThreadStatus::Exited));
    debug_assert_eq!(t.status(), ThreadStatus::Exited);

    let output = t.output();
    detach(&me, t);
    Ok(output)
}

/// Join every child of the current thread, optionally feeding each
/// child's output to `consumer`. Succeeds iff every join succeeds; on
/// failure the remaining children are still joined and the first error
/// is returned.
pub fn join_all_children(mut consumer: Option<&mut dyn FnMut(usize)>) -> Result<()> {
    let me = current();
    let snapshot: Vec<Arc<Thread>> = me.children.lock().clone();

    let mut first_err = None;
    for child in snapshot {
        match join(&child) {
            Ok(output) => {
                if let Some(f) = consumer.as_mut() {
                    f(output);
                }
            }
            Err(e) => {
                log::error!("could not join child {}: {e}", child.id());
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Exit the current thread with the given output value. Joins all
/// children first (children cannot outlive their parent), runs TLS
/// destructors, publishes the output, wakes all joiners, and hands the
/// CPU back to the scheduler permanently. Never returns.
pub fn exit(retval: usize) -> ! {
    let me = current();
    log::debug!("{} exiting on cpu {}", me.id(), arch::my_cpu_id());

    if join_all_children(None).is_err() {
        log::warn!("{} exiting with unjoinable children", me.id());
    }

    tls::run_destructors(&me);

    let wq = Arc::clone(&me.joinq);

    // Lock out joiners before our own state changes, so nobody can queue
    // on us mid-transition. Interrupts only need to be off long enough
    // to take the lock; preemption stays off until the scheduler switches.
    let flags = wq.lock_raw().lock_irq_save();
    sched::preempt_disable();
    arch::irq_restore(flags);

    me.set_output(retval);
    me.set_status(ThreadStatus::Exited);
    arch::fence();

    wq.wake_all_locked();

    let prev = me.refcount.fetch_sub(1, Ordering::AcqRel);
    if prev == 1 {
        // Nobody else holds a protocol reference (detached, or the
        // parent raced ahead). We are still on our own stack, so hand
        // the TCB to the reaper instead of destroying it here.
        reaper::on_refcount_zero(me.clone(), true);
    }

    let lock: *const Spinlock = wq.lock_raw();
    drop(me);
    drop(wq);

    // SAFETY: the joiner queue outlives this call: the TCB holds it, and
    // the TCB is kept alive by the parent's reference or by the reaper
    // queue entry taken above; destroy() waits in pre_destroy until this
    // thread is off-CPU before any of it is freed.
    unsafe { sched::ops().exit(&*lock) }
}

/// Tear down a thread whose lifecycle has completed: status EXITED (or
/// INIT for a thread that was never started) and protocol refcount zero.
/// Frees the scheduler hook; stack, TLS values and the joiner queue go
/// away with the TCB.
pub fn destroy(t: Arc<Thread>) -> Result<()> {
    match t.status() {
        ThreadStatus::Exited | ThreadStatus::Init => {}
        _ => return Err(ThreadError::InvalidState),
    }
    if t.refcount.load(Ordering::Acquire) != 0 {
        return Err(ThreadError::InvalidState);
    }

    log::debug!("destroying {}", t.id());

    sched::preempt_disable();
    sched::ops().pre_destroy(&t);

    // Defensive: pull the TCB off any queue it might still be linked on.
    if let Some(q) = t.take_wait_marker() {
        log::warn!("{} was still on a wait queue at destroy", t.id());
        // SAFETY: wakers clear the marker under the queue lock, so a
        // surviving marker means no waker ever dequeued this TCB and the
        // queue that parked it still holds a reference to it.
        unsafe { (*q).remove(&t) };
    }
    if !t.joinq.is_empty() {
        log::warn!("{} destroyed with joiners still queued", t.id());
        t.joinq.clear();
    }

    sched::ops().thread_state_deinit(&t);
    t.clear_sched_hook();
    t.set_status(ThreadStatus::Reaped);
    sched::preempt_enable();
    Ok(())
}

/// Voluntarily give up the CPU. The scheduler releases the TCB lock
/// after the switch.
pub fn yield_now() {
    let me = current();
    me.lock.lock();
    sched::ops().yield_now(&me.lock);
}

/// Wake every thread waiting for the current thread to exit.
pub fn wake_joiners() {
    let me = current();
    me.joinq.wake_all();
}

/// Store the output value the current thread's parent will observe at
/// join. Used on the forked-child path, which has no entry function to
/// return from.
pub fn set_fork_output(output: usize) {
    current().set_output(output);
}

/// Unpublished TCB with a real stack, for exercising the stack-image
/// builders without a scheduler.
#[cfg(test)]
pub(crate) fn test_thread_with_stack(size: usize) -> Arc<Thread> {
    fn nop(_: usize) -> usize {
        0
    }
    Thread::build(
        Some(nop),
        0,
        ThreadFlags::empty(),
        StackMem::alloc(size).unwrap(),
        CPU_ANY,
        Weak::new(),
        ThreadStatus::Init,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_the_dag() {
        use ThreadStatus::*;
        let legal = [
            (Init, Runnable),
            (Runnable, Running),
            (Running, Runnable),
            (Running, Waiting),
            (Waiting, Runnable),
            (Running, Exited),
            (Waiting, Exited),
            (Init, Exited),
            (Exited, Reaped),
            (Init, Reaped),
        ];
        for (from, to) in legal {
            assert!(from.can_transition(to), "{from} -> {to} should be legal");
        }
        let illegal = [
            (Init, Running),
            (Init, Waiting),
            (Runnable, Waiting),
            (Waiting, Running),
            (Exited, Running),
            (Exited, Runnable),
            (Reaped, Exited),
            (Reaped, Runnable),
            (Exited, Exited),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition(to), "{from} -> {to} should be illegal");
        }
    }

    #[test]
    fn bootstrap_thread_shape() {
        let t = Thread::bootstrap("init");
        assert_eq!(t.name(), "init");
        assert_eq!(t.status(), ThreadStatus::Running);
        assert!(t.is_detached());
        assert_eq!(t.refcount(), 1);
        assert!(t.parent().is_none());
        assert!(!t.id().is_none());
    }

    #[test]
    fn long_names_are_truncated() {
        let t = Thread::bootstrap("x");
        let long = "a".repeat(MAX_NAME_LEN * 2);
        t.set_name(&long);
        assert_eq!(t.name().len(), MAX_NAME_LEN);
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = Thread::bootstrap("a");
        let b = Thread::bootstrap("b");
        assert!(b.id().as_u64() > a.id().as_u64());
    }
}

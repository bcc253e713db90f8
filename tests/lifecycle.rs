/*
 * Thread Lifecycle Scenarios
 *
 * Join trees, boundary conditions on create/start/destroy/join, and
 * the reaping of finished threads, all on the hosted port.
 */

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use kthreads::thread::{self, Thread, ThreadFlags, ThreadStatus, reaper};
use kthreads::{CPU_ANY, ThreadError, WaitQueue, arch};

fn ident_entry(_: usize) -> usize {
    thread::current().id().as_u64() as usize
}

fn double_entry(x: usize) -> usize {
    x * 2
}

#[test]
fn join_tree_sums_child_outputs() {
    common::setup();
    // Start from a clean child set in case this OS thread ran an
    // earlier test.
    let _ = thread::join_all_children(None);

    let mut handles = Vec::new();
    let mut expected = 0usize;
    for _ in 0..8 {
        let t = thread::spawn(ident_entry, 0, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
        expected += t.id().as_u64() as usize;
        handles.push(t);
    }

    let mut total = 0usize;
    thread::join_all_children(Some(&mut |output| total += output)).unwrap();
    assert_eq!(total, expected);

    // Whoever dropped the last reference, a reap sweep eventually
    // destroys every child TCB.
    common::wait_until("children to be reaped", || {
        reaper::reap_pending();
        handles.iter().all(|t| t.status() == ThreadStatus::Reaped)
    });
    for t in &handles {
        // The parent's set no longer knows them.
        assert_eq!(thread::join(t), Err(ThreadError::InvalidState));
    }
}

#[test]
fn thread_ids_are_unique() {
    common::setup();

    let handles: Vec<_> = (0..10)
        .map(|i| thread::spawn(double_entry, i, ThreadFlags::empty(), 0, CPU_ANY).unwrap())
        .collect();

    let ids: HashSet<u64> = handles.iter().map(|t| t.id().as_u64()).collect();
    assert_eq!(ids.len(), handles.len());
    assert!(!ids.contains(&0), "id 0 is reserved");

    for (i, t) in handles.iter().enumerate() {
        assert_eq!(thread::join(t).unwrap(), i * 2);
    }
}

#[test]
fn join_after_exit_returns_immediately() {
    common::setup();

    let t = thread::spawn(double_entry, 21, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    common::wait_until("child to exit", || t.status() == ThreadStatus::Exited);

    // The exit predicate is already true: no enqueue, no wake needed.
    assert_eq!(thread::join(&t).unwrap(), 42);
}

#[test]
fn bad_cpu_binding_is_rejected() {
    common::setup();

    let cpus = arch::cpu_count() as i32;
    assert_eq!(
        thread::create(double_entry, 0, ThreadFlags::empty(), 0, cpus).unwrap_err(),
        ThreadError::InvalidArgument
    );
    assert_eq!(
        thread::create(double_entry, 0, ThreadFlags::empty(), 0, -2).unwrap_err(),
        ThreadError::InvalidArgument
    );
    // Binding to a real CPU works.
    let t = thread::spawn(double_entry, 3, ThreadFlags::empty(), 0, 0).unwrap();
    assert_eq!(t.bound_cpu(), 0);
    assert_eq!(thread::join(&t).unwrap(), 6);
}

static HOLD_WQ: WaitQueue = WaitQueue::new();
static HOLD: AtomicUsize = AtomicUsize::new(0);

fn hold_entry(_: usize) -> usize {
    HOLD_WQ.sleep_extended(Some(&|| HOLD.load(Ordering::SeqCst) == 1));
    0
}

#[test]
fn destroy_rejects_live_threads() {
    common::setup();
    let wq = &HOLD_WQ;

    let t = thread::spawn(hold_entry, 0, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    common::wait_until("child to block", || t.status() == ThreadStatus::Waiting);

    // Not EXITED, refcount not zero: both gates refuse.
    assert_eq!(
        thread::destroy(t.clone()).unwrap_err(),
        ThreadError::InvalidState
    );

    HOLD.store(1, Ordering::SeqCst);
    wq.wake_all();
    assert_eq!(thread::join(&t).unwrap(), 0);
}

static FOREIGN: OnceLock<Arc<Thread>> = OnceLock::new();

fn foreign_joiner(_: usize) -> usize {
    // Joining a thread we did not create must fail.
    match thread::join(FOREIGN.get().unwrap()) {
        Err(ThreadError::InvalidState) => 1,
        _ => 0,
    }
}

#[test]
fn join_is_parent_only() {
    common::setup();

    let victim = thread::spawn(double_entry, 1, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    FOREIGN.set(victim.clone()).ok();

    let joiner = thread::spawn(foreign_joiner, 0, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    assert_eq!(thread::join(&joiner).unwrap(), 1);
    assert_eq!(thread::join(&victim).unwrap(), 2);
}

#[test]
fn start_is_a_one_shot() {
    common::setup();

    let t = thread::create(double_entry, 4, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    thread::start(&t).unwrap();
    assert_eq!(thread::start(&t).unwrap_err(), ThreadError::InvalidState);
    assert_eq!(thread::join(&t).unwrap(), 8);
}

#[test]
fn detached_threads_cannot_be_joined_and_are_reaped() {
    common::setup();

    let t = thread::spawn(double_entry, 5, ThreadFlags::DETACHED, 0, CPU_ANY).unwrap();
    assert_eq!(thread::join(&t).unwrap_err(), ThreadError::InvalidState);

    // A detached thread goes through the zombie queue once it exits.
    common::wait_until("detached thread to be reaped", || {
        reaper::reap_pending();
        t.status() == ThreadStatus::Reaped
    });
}

fn yielding_entry(rounds: usize) -> usize {
    for _ in 0..rounds {
        thread::yield_now();
    }
    rounds
}

#[test]
fn voluntary_yield_resumes() {
    common::setup();
    let t = thread::spawn(yielding_entry, 16, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    assert_eq!(thread::join(&t).unwrap(), 16);
}

#[test]
fn default_stack_size_applies() {
    common::setup();
    let t = thread::spawn(double_entry, 9, ThreadFlags::empty(), 0, CPU_ANY).unwrap();
    assert_eq!(thread::join(&t).unwrap(), 18);

    // An explicit stack size is honored too.
    let big = thread::spawn(double_entry, 10, ThreadFlags::empty(), 64 * 1024, CPU_ANY).unwrap();
    assert_eq!(thread::join(&big).unwrap(), 20);
}

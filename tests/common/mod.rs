/*
 * Hosted Scheduler Port
 *
 * A `SchedOps` implementation that runs kernel threads on OS threads so
 * the core's protocols can be exercised end to end on a host:
 *
 * - `make_runnable` spawns an OS thread that runs the TCB's entry
 *   function and then calls the core's `exit`.
 * - `sleep` parks the calling OS thread on a per-thread condvar;
 *   `awaken` sets the wake flag and notifies. The wake flag is flipped
 *   under the same mutex the sleeper holds while releasing the queue
 *   lock, so the no-lost-wakeup contract holds.
 * - `exit` releases the queue lock, announces that the thread is fully
 *   off-CPU (what `pre_destroy` waits for), and parks forever - the
 *   "never resumed" contract.
 *
 * On bare metal the queue lock is released only after the context
 * switch commits, because the sleeper's stack is about to be reused.
 * Here every "kernel thread" owns its OS stack, so releasing before the
 * condvar wait is safe; the wake-flag handshake provides the atomicity
 * the contract exists for.
 */

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use kthreads::sched::SchedHook;
use kthreads::thread::{Thread, ThreadStatus};
use kthreads::{ReapPolicy, SchedOps, Spinlock};

struct Worker {
    started: AtomicBool,
    state: Mutex<WorkerState>,
    wake: Condvar,
    parked: Mutex<bool>,
    parked_cv: Condvar,
}

#[derive(Default)]
struct WorkerState {
    runnable: bool,
}

impl Worker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            state: Mutex::new(WorkerState::default()),
            wake: Condvar::new(),
            parked: Mutex::new(false),
            parked_cv: Condvar::new(),
        })
    }
}

pub struct HostSched {
    workers: Mutex<HashMap<u64, Arc<Worker>>>,
    threads: Mutex<HashMap<u64, Arc<Thread>>>,
}

std::thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

impl HostSched {
    fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
        }
    }

    fn worker(&self, id: u64) -> Arc<Worker> {
        self.workers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("host port: unknown thread {id}"))
    }

    fn register_bootstrap(&self, t: &Arc<Thread>) {
        let id = t.id().as_u64();
        self.workers.lock().unwrap().insert(id, Worker::new());
        self.threads.lock().unwrap().insert(id, t.clone());
    }

    fn worker_main(t: Arc<Thread>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(t.clone()));
        t.set_status(ThreadStatus::Running);
        let entry = t.entry().expect("host port: started thread without entry");
        let input = t.input();
        drop(t);
        let output = entry(input);
        kthreads::thread::exit(output)
    }
}

impl SchedOps for HostSched {
    fn thread_state_init(&self, thread: &Thread, _is_boot: bool) -> Option<SchedHook> {
        let id = thread.id().as_u64();
        self.workers.lock().unwrap().insert(id, Worker::new());
        Some(Box::new(id))
    }

    fn thread_state_deinit(&self, thread: &Thread) {
        let id = thread.id().as_u64();
        self.workers.lock().unwrap().remove(&id);
        self.threads.lock().unwrap().remove(&id);
    }

    fn post_create(&self, thread: &Arc<Thread>) -> kthreads::Result<()> {
        self.threads
            .lock()
            .unwrap()
            .insert(thread.id().as_u64(), thread.clone());
        Ok(())
    }

    fn pre_destroy(&self, thread: &Thread) {
        let worker = self.worker(thread.id().as_u64());
        if !worker.started.load(Ordering::Acquire) {
            return;
        }
        // Wait until the exiting thread is fully off its (conceptual)
        // CPU before anything of it is freed.
        let mut parked = worker.parked.lock().unwrap();
        while !*parked {
            parked = worker.parked_cv.wait(parked).unwrap();
        }
    }

    fn make_runnable(
        &self,
        thread: &Arc<Thread>,
        _cpu: i32,
        _immediate: bool,
    ) -> kthreads::Result<()> {
        let worker = self.worker(thread.id().as_u64());
        worker.started.store(true, Ordering::Release);
        thread.set_current_cpu(0);

        let t = thread.clone();
        std::thread::Builder::new()
            .name(format!("kthread-{}", t.id().as_u64()))
            .spawn(move || Self::worker_main(t))
            .expect("host port: OS thread spawn failed");
        Ok(())
    }

    fn awaken(&self, thread: &Arc<Thread>, _cpu: u32) -> kthreads::Result<()> {
        let worker = self.worker(thread.id().as_u64());
        thread.set_status(ThreadStatus::Runnable);
        let mut state = worker.state.lock().unwrap();
        state.runnable = true;
        worker.wake.notify_all();
        Ok(())
    }

    fn sleep(&self, queue_lock: &Spinlock) {
        let me = CURRENT
            .with(|c| c.borrow().clone())
            .expect("host port: sleep without a current thread");
        let worker = self.worker(me.id().as_u64());

        let mut state = worker.state.lock().unwrap();
        state.runnable = false;
        // An awaken can only run once the queue lock is free, and then
        // blocks on the state mutex we hold until the condvar wait
        // releases it: the wakeup cannot be lost.
        queue_lock.unlock();
        kthreads::sched::preempt_enable();

        while !state.runnable {
            state = worker.wake.wait(state).unwrap();
        }
        drop(state);
        me.set_status(ThreadStatus::Running);
    }

    fn exit(&self, queue_lock: &Spinlock) -> ! {
        let me = CURRENT
            .with(|c| c.borrow_mut().take())
            .expect("host port: exit without a current thread");
        let worker = self.worker(me.id().as_u64());
        drop(me);

        kthreads::sched::preempt_enable();
        queue_lock.unlock();

        *worker.parked.lock().unwrap() = true;
        worker.parked_cv.notify_all();

        // Never resumed.
        loop {
            std::thread::park();
        }
    }

    fn yield_now(&self, tcb_lock: &Spinlock) {
        tcb_lock.unlock();
        std::thread::yield_now();
    }

    fn kick_cpu(&self, _cpu: u32) {}

    fn map_threads(&self, _cpu: i32, f: &mut dyn FnMut(&Arc<Thread>)) {
        let snapshot: Vec<_> = self.threads.lock().unwrap().values().cloned().collect();
        for t in &snapshot {
            f(t);
        }
    }

    fn current_thread(&self) -> Arc<Thread> {
        CURRENT
            .with(|c| c.borrow().clone())
            .expect("host port: no current thread on this OS thread")
    }
}

/// Stderr logger in the embedding kernel's style.
struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;
static PORT: OnceLock<&'static HostSched> = OnceLock::new();

/// Bring the core up on the hosted port (first caller wins; the policy
/// is fixed per test binary) and adopt the calling OS thread as a
/// kernel thread.
pub fn setup_with_policy(policy: ReapPolicy) -> &'static HostSched {
    let port = *PORT.get_or_init(|| {
        let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Info));
        let port: &'static HostSched = Box::leak(Box::new(HostSched::new()));
        kthreads::init(port, 2, policy);
        port
    });
    adopt_current(port, "test-main");
    port
}

pub fn setup() -> &'static HostSched {
    setup_with_policy(ReapPolicy::Immediate)
}

/// Give the calling OS thread a TCB so it can create, join and sleep.
fn adopt_current(port: &HostSched, name: &str) -> Arc<Thread> {
    if let Some(t) = CURRENT.with(|c| c.borrow().clone()) {
        return t;
    }
    let t = Thread::bootstrap(name);
    port.register_bootstrap(&t);
    CURRENT.with(|c| *c.borrow_mut() = Some(t.clone()));
    t
}

/// Spin-poll `cond` with a deadline; panics when the deadline passes.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !cond() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

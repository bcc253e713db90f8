/*
 * Thread-Local Storage
 *
 * A fixed global table of TLS key slots plus a per-thread value array
 * in the TCB. Each slot carries a sequence counter: even means free,
 * odd means allocated, and the only legal transition is a CAS bump of
 * one. A key handle created before a delete/realloc cycle therefore
 * never matches the slot again (the sequence moved on), which makes
 * stale handles fail instead of aliasing a new key.
 *
 * At thread exit the destructor sweep runs up to MIN_DESTRUCT_ITER
 * passes, because a destructor may store fresh values into other slots.
 */

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, ThreadError};
use crate::params::{MIN_DESTRUCT_ITER, TLS_MAX_KEYS};
use crate::thread::Thread;

/// Destructor invoked at thread exit for each key with a non-null value.
pub type TlsDestructor = fn(*mut u8);

/// Handle to an allocated TLS slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsKey(pub(crate) usize);

impl TlsKey {
    pub fn index(self) -> usize {
        self.0
    }
}

struct TlsSlot {
    /// Even = free, odd = allocated. Only ever CAS-bumped by one.
    seq: AtomicU32,
    /// Written by the allocator that won the CAS for the current odd
    /// sequence; read by the exit sweep.
    destructor: UnsafeCell<Option<TlsDestructor>>,
}

// SAFETY: `destructor` is written only by the thread that just claimed
// the slot via the sequence CAS, before the key is handed out.
unsafe impl Sync for TlsSlot {}

static TLS_KEYS: [TlsSlot; TLS_MAX_KEYS] = [const {
    TlsSlot {
        seq: AtomicU32::new(0),
        destructor: UnsafeCell::new(None),
    }
}; TLS_MAX_KEYS];

fn slot_free(seq: u32) -> bool {
    seq & 1 == 0
}

/// A slot one bump away from wrapping is retired rather than reused.
fn slot_usable(seq: u32) -> bool {
    seq < u32::MAX - 1
}

/// Allocate a TLS key, optionally with a destructor run at thread exit.
/// Fails with `ResourceExhausted` when every slot is taken.
pub fn key_create(destructor: Option<TlsDestructor>) -> Result<TlsKey> {
    for (i, slot) in TLS_KEYS.iter().enumerate() {
        let seq = slot.seq.load(Ordering::Acquire);
        if slot_free(seq)
            && slot_usable(seq)
            && slot
                .seq
                .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            // SAFETY: the CAS above made this thread the slot's owner;
            // no reader sees the slot allocated before the key returns.
            unsafe { *slot.destructor.get() = destructor };
            return Ok(TlsKey(i));
        }
    }
    Err(ThreadError::ResourceExhausted)
}

/// Release a TLS key. Per-thread values stored under it are not wiped;
/// they simply become unreachable.
pub fn key_delete(key: TlsKey) -> Result<()> {
    let slot = TLS_KEYS.get(key.0).ok_or(ThreadError::InvalidArgument)?;
    let seq = slot.seq.load(Ordering::Acquire);
    if !slot_free(seq)
        && slot
            .seq
            .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    {
        Ok(())
    } else {
        Err(ThreadError::InvalidState)
    }
}

/// Read the current thread's value for `key`. Null if never set.
pub fn get(key: TlsKey) -> Result<*mut u8> {
    let slot = TLS_KEYS.get(key.0).ok_or(ThreadError::InvalidArgument)?;
    if slot_free(slot.seq.load(Ordering::Acquire)) {
        return Err(ThreadError::InvalidState);
    }
    let t = crate::thread::current();
    Ok(t.tls[key.0].load(Ordering::Acquire) as *mut u8)
}

/// Store the current thread's value for `key`.
pub fn set(key: TlsKey, value: *mut u8) -> Result<()> {
    let slot = TLS_KEYS.get(key.0).ok_or(ThreadError::InvalidArgument)?;
    if slot_free(slot.seq.load(Ordering::Acquire)) {
        return Err(ThreadError::InvalidState);
    }
    let t = crate::thread::current();
    t.tls[key.0].store(value as usize, Ordering::Release);
    Ok(())
}

/// Exit-time destructor sweep over the key table. Each pass takes every
/// non-null value (nulling it first) and runs the slot's destructor; a
/// pass that called nothing ends the sweep early.
pub(crate) fn run_destructors(t: &Thread) {
    for _ in 0..MIN_DESTRUCT_ITER {
        let mut called = false;
        for (i, slot) in TLS_KEYS.iter().enumerate() {
            let value = t.tls[i].swap(0, Ordering::AcqRel);
            if value == 0 {
                continue;
            }
            // A concurrent key_delete can race this read; running the
            // previous destructor on our own value is the accepted
            // outcome.
            let destructor = if slot_free(slot.seq.load(Ordering::Acquire)) {
                None
            } else {
                // SAFETY: written before the slot's key was handed out.
                unsafe { *slot.destructor.get() }
            };
            if let Some(d) = destructor {
                called = true;
                d(value as *mut u8);
            }
        }
        if !called {
            break;
        }
    }
}

/// End-to-end smoke test of the TLS surface, runnable from the shell's
/// `thread test` command: allocate keys, store and read back values,
/// release everything, then cycle one slot again.
pub fn self_test() -> Result<()> {
    let mut keys = alloc::vec::Vec::new();

    while let Ok(key) = key_create(None) {
        keys.push(key);
        if keys.len() == TLS_MAX_KEYS {
            break;
        }
    }
    if keys.is_empty() {
        log::error!("tls self test: no free keys");
        return Err(ThreadError::ResourceExhausted);
    }

    let mut result = Ok(());
    'check: {
        for (i, &key) in keys.iter().enumerate() {
            if let Err(e) = set(key, (i + 100) as *mut u8) {
                log::error!("tls self test: set failed on key {i}: {e}");
                result = Err(e);
                break 'check;
            }
        }
        for (i, &key) in keys.iter().enumerate() {
            match get(key) {
                Ok(v) if v as usize == i + 100 => {}
                Ok(v) => {
                    log::error!(
                        "tls self test: mismatched value, got {:p}, want {:#x}",
                        v,
                        i + 100
                    );
                    result = Err(ThreadError::InvalidState);
                    break 'check;
                }
                Err(e) => {
                    result = Err(e);
                    break 'check;
                }
            }
        }
    }

    for &key in &keys {
        if let Err(e) = key_delete(key) {
            log::error!("tls self test: delete failed: {e}");
            result = result.and(Err(e));
        }
    }

    // One more allocate/release cycle through a now-bumped slot.
    result = result.and_then(|()| {
        let key = key_create(None)?;
        key_delete(key)
    });

    if result.is_ok() {
        log::info!("thread local storage test succeeded");
    }
    result
}

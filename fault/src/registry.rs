//! The handler slot table.
//!
//! Registration and removal take a mutex (they happen on ordinary
//! threads), but dispatch runs on a signal frame and must not lock:
//! slots are published with release stores and read with acquire loads.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::{Exception, FaultHandlerFn};

/// Upper bound on concurrently registered handlers. One per code
/// cache; sized generously so test suites that build many caches in
/// parallel never trip it.
const MAX_HANDLERS: usize = 32;

struct Slot {
    /// Callback, stored as usize. 0 = slot free. Written under
    /// `REG_LOCK`, read lock-free by `dispatch`.
    cb: AtomicUsize,
    data: AtomicPtr<c_void>,
    /// Registration sequence number, used to keep dispatch in
    /// registration order even after slot reuse.
    seq: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
    cb: AtomicUsize::new(0),
    data: AtomicPtr::new(std::ptr::null_mut()),
    seq: AtomicU64::new(0),
};

static SLOTS: [Slot; MAX_HANDLERS] = [EMPTY_SLOT; MAX_HANDLERS];
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);
static REG_LOCK: Mutex<usize> = Mutex::new(0);

/// Token returned by [`register`], consumed by [`unregister`].
#[derive(Debug)]
pub struct HandlerId(usize);

/// Register a fault handler. The first registration installs the
/// process signal handlers.
///
/// `data` is passed back verbatim on every dispatch; the caller keeps
/// it valid until [`unregister`].
pub fn register(data: *mut c_void, cb: FaultHandlerFn) -> HandlerId {
    let mut count = REG_LOCK.lock().unwrap();

    let idx = SLOTS
        .iter()
        .position(|s| s.cb.load(Ordering::Relaxed) == 0)
        .expect("fault handler table full");

    let slot = &SLOTS[idx];
    slot.data.store(data, Ordering::Relaxed);
    slot.seq
        .store(NEXT_SEQ.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
    // Publish last: a dispatcher that sees cb != 0 must also see data
    // and seq.
    slot.cb.store(cb as usize, Ordering::Release);

    *count += 1;
    if *count == 1 {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        crate::sys::install();
    }

    HandlerId(idx)
}

/// Remove a previously registered handler. The last removal restores
/// the saved signal dispositions.
pub fn unregister(id: HandlerId) {
    let mut count = REG_LOCK.lock().unwrap();

    let slot = &SLOTS[id.0];
    assert!(slot.cb.load(Ordering::Relaxed) != 0, "double unregister");
    slot.cb.store(0, Ordering::Release);
    slot.data.store(std::ptr::null_mut(), Ordering::Relaxed);

    *count -= 1;
    if *count == 0 {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        crate::sys::restore();
    }
}

/// Dispatch `ex` to the registered handlers, oldest registration
/// first. Lock-free; callable from a signal frame.
pub fn dispatch(ex: &mut Exception) -> bool {
    // Snapshot occupied slots. MAX_HANDLERS is tiny, so ordering by
    // repeated min-scan keeps this allocation-free.
    let mut seen: u64 = 0;
    loop {
        let mut best: Option<(u64, usize)> = None;
        for (i, slot) in SLOTS.iter().enumerate() {
            if slot.cb.load(Ordering::Acquire) == 0 {
                continue;
            }
            let seq = slot.seq.load(Ordering::Relaxed);
            if seq <= seen {
                continue;
            }
            if best.map_or(true, |(bseq, _)| seq < bseq) {
                best = Some((seq, i));
            }
        }
        let Some((seq, idx)) = best else {
            return false;
        };
        seen = seq;

        let slot = &SLOTS[idx];
        let cb = slot.cb.load(Ordering::Acquire);
        if cb == 0 {
            continue;
        }
        let data = slot.data.load(Ordering::Relaxed);
        // SAFETY: cb was stored from a FaultHandlerFn and is non-zero.
        let cb: FaultHandlerFn = unsafe { std::mem::transmute(cb) };
        if cb(data, ex) {
            return true;
        }
    }
}

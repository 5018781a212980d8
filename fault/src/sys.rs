//! Linux x86-64 signal plumbing.
//!
//! Converts a SIGSEGV/SIGBUS into an [`Exception`], runs the registry,
//! and on accept writes the (possibly repaired) register state back
//! into the interrupted thread context so execution resumes at
//! `state.rip`.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem::{self, MaybeUninit};

use crate::{Exception, ThreadState, NUM_HOST_REGS};

/// ucontext greg index for each ModR/M-numbered register.
const GREG_IDX: [i32; NUM_HOST_REGS] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

/// Saved prior dispositions for SIGSEGV / SIGBUS. Written by
/// `install` before anything reads them.
struct OldActions(UnsafeCell<[MaybeUninit<libc::sigaction>; 2]>);

// SAFETY: written only while the registry lock is held (install /
// restore); the unhandled-fault path reads it while the process is
// already on its way down.
unsafe impl Sync for OldActions {}

static OLD: OldActions = OldActions(UnsafeCell::new(
    [MaybeUninit::uninit(), MaybeUninit::uninit()],
));

const SIGNALS: [i32; 2] = [libc::SIGSEGV, libc::SIGBUS];

/// Install the trampoline for SIGSEGV and SIGBUS, saving the previous
/// actions. Called with the registry lock held.
pub(crate) fn install() {
    // SAFETY: standard sigaction setup; OLD is guarded by the
    // registry lock.
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = trampoline as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);

        let old = &mut *OLD.0.get();
        for (i, &sig) in SIGNALS.iter().enumerate() {
            libc::sigaction(sig, &sa, old[i].as_mut_ptr());
        }
    }
    log::debug!("fault trampoline installed");
}

/// Reinstate the saved actions. Called with the registry lock held.
pub(crate) fn restore() {
    // SAFETY: OLD was filled by install(); guarded by the registry
    // lock.
    unsafe {
        let old = &*OLD.0.get();
        for (i, &sig) in SIGNALS.iter().enumerate() {
            libc::sigaction(sig, old[i].as_ptr(), std::ptr::null_mut());
        }
    }
    log::debug!("fault trampoline removed");
}

unsafe extern "C" fn trampoline(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uctx: *mut c_void,
) {
    let uctx = &mut *(uctx as *mut libc::ucontext_t);
    let gregs = &mut uctx.uc_mcontext.gregs;

    let mut state = ThreadState::new();
    state.rip = gregs[libc::REG_RIP as usize] as u64;
    for (i, &g) in GREG_IDX.iter().enumerate() {
        state.regs[i] = gregs[g as usize] as u64;
    }

    let mut ex = Exception {
        pc: state.rip,
        fault_addr: (*info).si_addr() as u64,
        state,
    };

    if crate::registry::dispatch(&mut ex) {
        for (i, &g) in GREG_IDX.iter().enumerate() {
            gregs[g as usize] = ex.state.regs[i] as i64;
        }
        gregs[libc::REG_RIP as usize] = ex.state.rip as i64;
        return;
    }

    // Nobody claimed the fault: put the previous disposition back and
    // return, so the re-executed instruction faults again and the
    // process takes the default (fatal) path.
    let idx = SIGNALS.iter().position(|&s| s == sig).unwrap_or(0);
    let old = &*OLD.0.get();
    libc::sigaction(sig, old[idx].as_ptr(), std::ptr::null_mut());
}

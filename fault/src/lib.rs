//! Process-wide hardware fault dispatch.
//!
//! OS-level fault delivery is per-process, so this registry is an
//! unavoidable global. Code caches register a callback at creation and
//! unregister at destruction; when a SIGSEGV/SIGBUS arrives, registered
//! callbacks run in registration order on the faulting thread's signal
//! frame, and the first one to return `true` consumes the fault. If none
//! accept, the previous signal disposition is reinstated and the fault
//! re-raises, so it stays fatal.

mod registry;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod sys;

pub use registry::{register, unregister, HandlerId};

use std::ffi::c_void;

/// Number of host general-purpose registers tracked in a fault record.
pub const NUM_HOST_REGS: usize = 16;

/// Saved host register state at the faulting instruction.
///
/// `regs` is indexed by x86-64 register number (RAX = 0 ... R15 = 15,
/// the ModR/M encoding order). A handler that repairs the fault mutates
/// this copy; the signal trampoline writes it back into the thread
/// context before resuming.
#[derive(Debug, Clone, Copy)]
pub struct ThreadState {
    /// Instruction pointer to resume at.
    pub rip: u64,
    /// General-purpose registers, ModR/M numbering.
    pub regs: [u64; NUM_HOST_REGS],
}

impl ThreadState {
    pub fn new() -> Self {
        Self {
            rip: 0,
            regs: [0; NUM_HOST_REGS],
        }
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

/// A hardware fault delivered to a registered handler.
pub struct Exception {
    /// Host PC of the faulting instruction.
    pub pc: u64,
    /// Address whose access faulted (si_addr).
    pub fault_addr: u64,
    /// Mutable register state; written back on accept.
    pub state: ThreadState,
}

/// Handler callback. `data` is the opaque pointer passed to
/// [`register`]; returns whether the fault was consumed.
pub type FaultHandlerFn = fn(*mut c_void, &mut Exception) -> bool;

/// Run every registered handler against `ex` in registration order.
///
/// Returns `true` as soon as one accepts. Exposed so tests (and
/// non-signal callers, e.g. SEH shims) can drive dispatch with a
/// synthetic record.
pub fn dispatch(ex: &mut Exception) -> bool {
    registry::dispatch(ex)
}

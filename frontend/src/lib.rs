//! SH4 frontend — guest code scanning and IR emission.
//!
//! A translation unit is one straight-line run of guest instructions.
//! [`Sh4Frontend::translate`] first scans the stream to find the
//! block's extent (`analyze`), then re-walks the same bytes invoking
//! the per-opcode translators, and finally completes the fall-through
//! exit when the block does not already end in an unconditional
//! branch.

pub mod context;
pub mod opdef;
mod translate;

pub use context::Sh4Context;
pub use opdef::{get_opdef, Instr, Opdef, OpdefFlags};

use bitflags::bitflags;
use sh4jit_core::op::{OpFlags, Opcode};
use sh4jit_core::{IrBuilder, MemoryInterface};

use context::{FPSCR_PR, FPSCR_SZ, PC_OFFSET};
use translate::Tr;

bitflags! {
    /// Per-block compile flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        /// Guest memory accesses may be emitted as direct host
        /// loads/stores into the pre-mapped guest window.
        const FASTMEM = 1 << 0;
        /// A fastmem fault demoted this address; every access goes
        /// through the slow path.
        const SLOWMEM = 1 << 1;
        /// FPSCR.PR was set at compile time (double-precision FP).
        const DOUBLE_PR = 1 << 2;
        /// FPSCR.SZ was set at compile time (64-bit FP transfers).
        const DOUBLE_SZ = 1 << 3;
    }
}

/// Interpreter fallback: executes one instruction against the context.
/// Also invoked for invalid words, where it raises the guest's
/// illegal-instruction exception.
pub type FallbackFn = extern "C" fn(*mut Sh4Context, u32, u16);

/// Everything the frontend needs from the embedding guest.
///
/// Validity: `ctx` must point to a live [`Sh4Context`] for as long as
/// translation and execution happen against this guest.
#[derive(Clone, Copy)]
pub struct Sh4Guest {
    pub ctx: *mut Sh4Context,
    pub mem: MemoryInterface,
    pub fallback: FallbackFn,
}

/// Result of translating one block.
pub struct Translation {
    pub ir: IrBuilder,
    /// Guest bytes consumed.
    pub guest_size: u32,
    pub num_instrs: u32,
    pub num_cycles: u32,
}

struct BlockExtent {
    guest_size: u32,
    num_instrs: u32,
    num_cycles: u32,
}

pub struct Sh4Frontend {
    guest: Sh4Guest,
}

impl Sh4Frontend {
    pub fn new(guest: Sh4Guest) -> Self {
        Self { guest }
    }

    pub fn guest(&self) -> &Sh4Guest {
        &self.guest
    }

    /// Scan from `guest_addr` to find where the block ends.
    ///
    /// The block extends until just past an invalid word, or past any
    /// instruction (plus its delay slot) that transfers control or
    /// invalidates the flags the block was compiled under (SR/FPSCR
    /// writers). A delay slot may not itself be delayed; such a pair
    /// scans as invalid and the interpreter deals with it at run time.
    fn analyze(&self, guest_addr: u32) -> BlockExtent {
        let mem = &self.guest.mem;
        let mut addr = guest_addr;
        let mut extent = BlockExtent {
            guest_size: 0,
            num_instrs: 0,
            num_cycles: 0,
        };

        loop {
            let data = mem.read16(addr);
            let def = opdef::get_opdef(data);
            let mut invalid = def.is_none();

            addr += 2;
            extent.guest_size += 2;
            extent.num_instrs += 1;
            extent.num_cycles += def.map_or(1, |d| d.cycles);

            if let Some(def) = def {
                if def.flags.contains(OpdefFlags::DELAYED) {
                    let delay_data = mem.read16(addr);
                    let delay_def = opdef::get_opdef(delay_data);
                    invalid |= delay_def
                        .map_or(true, |d| d.flags.contains(OpdefFlags::DELAYED));

                    addr += 2;
                    extent.guest_size += 2;
                    extent.num_instrs += 1;
                    extent.num_cycles += delay_def.map_or(1, |d| d.cycles);
                }
            }

            if invalid {
                break;
            }

            let flags = def.unwrap().flags;
            if flags.intersects(
                OpdefFlags::BRANCH | OpdefFlags::SET_FPSCR | OpdefFlags::SET_SR,
            ) {
                break;
            }
        }

        extent
    }

    /// Translate the block starting at `guest_addr`.
    ///
    /// `flags` comes from the cache (FASTMEM policy plus anything
    /// merged from a demoted predecessor); the FP mode bits are
    /// derived here from the live FPSCR so FP instructions compile to
    /// the width the guest is actually running in.
    pub fn translate(&self, guest_addr: u32, mut flags: BlockFlags) -> Translation {
        // SAFETY: guest.ctx is valid per the Sh4Guest contract.
        let fpscr = unsafe { (*self.guest.ctx).fpscr };
        if fpscr & FPSCR_PR != 0 {
            flags |= BlockFlags::DOUBLE_PR;
        }
        if fpscr & FPSCR_SZ != 0 {
            flags |= BlockFlags::DOUBLE_SZ;
        }
        if flags.contains(BlockFlags::SLOWMEM) {
            flags.remove(BlockFlags::FASTMEM);
        }

        let extent = self.analyze(guest_addr);

        let mut ir = IrBuilder::new();
        let mut t = Tr {
            guest: &self.guest,
            ir: &mut ir,
            flags,
        };

        let end = guest_addr + extent.guest_size;
        let mut addr = guest_addr;
        while addr < end {
            let raw = t.guest.mem.read16(addr);
            match opdef::get_opdef(raw) {
                Some(def) => {
                    (def.translate)(&mut t, addr, Instr(raw));
                    if def.flags.contains(OpdefFlags::DELAYED) {
                        addr += 4;
                    } else {
                        addr += 2;
                    }
                }
                None => {
                    t.fallback(addr, raw);
                    addr += 2;
                }
            }
        }

        self.complete_fallthrough(&mut ir, end);

        log::trace!(
            "translated {:#010x}: {} instrs, {} bytes, flags {:?}",
            guest_addr,
            extent.num_instrs,
            extent.guest_size,
            flags
        );

        Translation {
            ir,
            guest_size: extent.guest_size,
            num_instrs: extent.num_instrs,
            num_cycles: extent.num_cycles,
        }
    }

    /// If the block does not end in an unconditional transfer, append
    /// a branch to the next guest PC so execution re-enters the
    /// dispatcher with the right address.
    fn complete_fallthrough(&self, ir: &mut IrBuilder, next_pc: u32) {
        let ends_in_branch = match ir.last_op() {
            Some(op) if op.def().flags.contains(OpFlags::BB_EXIT) => true,
            Some(op) if op.opc == Opcode::Fallback => {
                // A fallback for a branch opcode transfers control
                // inside the helper.
                let raw = op.cargs()[3] as u16;
                opdef::get_opdef(raw)
                    .map_or(false, |d| d.flags.contains(OpdefFlags::BRANCH))
            }
            _ => false,
        };

        if !ends_in_branch {
            ir.gen_branch(next_pc, PC_OFFSET);
        }
    }
}

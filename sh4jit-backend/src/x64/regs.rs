use sh4jit_core::Register;

/// x86-64 register codes (ModR/M and REX numbering).
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

/// Guest context pointer, live across the whole block.
pub const CTX_REG: u8 = RBP;

/// Fastmem base (host address of guest offset 0).
pub const MEMBASE_REG: u8 = R15;

/// Registers handed to the allocation pass. All callee-saved, so temp
/// values survive slow-path helper calls without shuffling.
pub static ALLOCATABLE: [Register; 4] = [
    Register {
        name: "rbx",
        code: RBX,
    },
    Register {
        name: "r12",
        code: R12,
    },
    Register {
        name: "r13",
        code: R13,
    },
    Register {
        name: "r14",
        code: R14,
    },
];

/// Callee-saved registers the block prologue must preserve, push
/// order. CTX_REG and MEMBASE_REG are clobbered by the prologue
/// itself; the allocatables by the block body.
pub const SAVED: [u8; 6] = [RBP, RBX, R12, R13, R14, R15];

#[inline]
pub const fn low3(reg: u8) -> u8 {
    reg & 0x7
}

#[inline]
pub const fn is_ext(reg: u8) -> bool {
    reg >= 8
}

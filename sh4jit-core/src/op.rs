use crate::types::{MemSize, Type};

/// Maximum number of arguments (temps + constants) per op.
pub const MAX_OP_ARGS: usize = 4;

/// IR opcodes. Each op reads its input temps, writes its output temp,
/// and may carry raw constant arguments (see [`OpDef`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,

    // -- Data movement --
    Mov,

    // -- ALU --
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Not,
    Neg,
    SetCond,

    // -- Guest context (register file) access --
    LoadCtx,
    StoreCtx,

    // -- Guest memory access --
    LoadGuest,
    StoreGuest,

    // -- Spill slots (inserted by register allocation) --
    LoadSlot,
    StoreSlot,

    // -- Block exits --
    Branch,
    BranchCond,
    BranchInd,

    // -- Interpreter fallback call --
    Fallback,

    // Sentinel, must be last.
    Count,
}

/// Static properties of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u8);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Observable effect beyond the output temp; never removed by DCE.
    pub const SIDE_EFFECTS: OpFlags = OpFlags(0x01);
    /// Unconditionally leaves the block.
    pub const BB_EXIT: OpFlags = OpFlags(0x02);
    /// May leave the block (conditional exit).
    pub const COND_EXIT: OpFlags = OpFlags(0x04);
    /// Calls out of generated code; clobbers all guest context state.
    pub const CALL: OpFlags = OpFlags(0x08);

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: OpFlags) -> OpFlags {
        OpFlags(self.0 | other.0)
    }
}

/// Argument counts and flags for one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub name: &'static str,
    pub nb_oargs: u8,
    pub nb_iargs: u8,
    pub nb_cargs: u8,
    pub flags: OpFlags,
}

const fn def(
    name: &'static str,
    nb_oargs: u8,
    nb_iargs: u8,
    nb_cargs: u8,
    flags: OpFlags,
) -> OpDef {
    OpDef {
        name,
        nb_oargs,
        nb_iargs,
        nb_cargs,
        flags,
    }
}

/// Indexed by `Opcode as usize`. Order must match the enum.
pub const OPCODE_DEFS: [OpDef; Opcode::Count as usize] = [
    def("nop", 0, 0, 0, OpFlags::NONE),
    def("mov", 1, 1, 0, OpFlags::NONE),
    def("add", 1, 2, 0, OpFlags::NONE),
    def("sub", 1, 2, 0, OpFlags::NONE),
    def("and", 1, 2, 0, OpFlags::NONE),
    def("or", 1, 2, 0, OpFlags::NONE),
    def("xor", 1, 2, 0, OpFlags::NONE),
    def("shl", 1, 2, 0, OpFlags::NONE),
    def("shr", 1, 2, 0, OpFlags::NONE),
    def("sar", 1, 2, 0, OpFlags::NONE),
    def("not", 1, 1, 0, OpFlags::NONE),
    def("neg", 1, 1, 0, OpFlags::NONE),
    // setcond d, a, b; carg = Cond
    def("setcond", 1, 2, 1, OpFlags::NONE),
    // load_ctx d; carg = byte offset
    def("load_ctx", 1, 0, 1, OpFlags::NONE),
    // store_ctx s; carg = byte offset
    def("store_ctx", 0, 1, 1, OpFlags::SIDE_EFFECTS),
    // load_guest d, addr; width/sign/fastmem in Op::access
    def("load_guest", 1, 1, 0, OpFlags::SIDE_EFFECTS),
    // store_guest addr, s
    def("store_guest", 0, 2, 0, OpFlags::SIDE_EFFECTS),
    // load_slot d; carg = slot index
    def("load_slot", 1, 0, 1, OpFlags::NONE),
    // store_slot s; carg = slot index
    def("store_slot", 0, 1, 1, OpFlags::SIDE_EFFECTS),
    // branch; cargs = target pc, ctx pc offset
    def(
        "branch",
        0,
        0,
        2,
        OpFlags::SIDE_EFFECTS.union(OpFlags::BB_EXIT),
    ),
    // branch_cond cond; cargs = target pc, ctx pc offset
    def(
        "branch_cond",
        0,
        1,
        2,
        OpFlags::SIDE_EFFECTS.union(OpFlags::COND_EXIT),
    ),
    // branch_ind addr; carg = ctx pc offset
    def(
        "branch_ind",
        0,
        1,
        1,
        OpFlags::SIDE_EFFECTS.union(OpFlags::BB_EXIT),
    ),
    // fallback; cargs = handler lo, handler hi, guest addr, raw instr
    def(
        "fallback",
        0,
        0,
        4,
        OpFlags::SIDE_EFFECTS.union(OpFlags::CALL),
    ),
];

/// Packed guest-memory access descriptor for LoadGuest/StoreGuest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestAccess(u8);

impl GuestAccess {
    const SIGNED: u8 = 0x04;
    const FASTMEM: u8 = 0x08;

    pub const fn new(size: MemSize, signed: bool, fastmem: bool) -> Self {
        let mut bits = size as u8;
        if signed {
            bits |= Self::SIGNED;
        }
        if fastmem {
            bits |= Self::FASTMEM;
        }
        GuestAccess(bits)
    }

    pub const fn size(self) -> MemSize {
        MemSize::from_log2(self.0)
    }

    pub const fn is_signed(self) -> bool {
        self.0 & Self::SIGNED != 0
    }

    pub const fn is_fastmem(self) -> bool {
        self.0 & Self::FASTMEM != 0
    }
}

/// Placeholder in [`Op::regs`] for arguments without a host register
/// (constants, raw cargs, not-yet-allocated temps).
pub const NO_REG: u8 = 0xff;

/// A single IR operation.
///
/// `args` holds output temps, then input temps, then raw constants, in
/// the counts given by the opcode's [`OpDef`]. `regs` parallels `args`;
/// register allocation fills in the host register carrying each temp
/// argument at this op.
#[derive(Debug, Clone)]
pub struct Op {
    pub opc: Opcode,
    pub ty: Type,
    pub access: GuestAccess,
    pub args: [u32; MAX_OP_ARGS],
    pub regs: [u8; MAX_OP_ARGS],
}

impl Op {
    pub fn new(opc: Opcode, ty: Type, args: &[u32]) -> Self {
        let d = &OPCODE_DEFS[opc as usize];
        assert_eq!(args.len(), d.nb_args(), "arg count for {}", d.name);
        let mut a = [0u32; MAX_OP_ARGS];
        a[..args.len()].copy_from_slice(args);
        Self {
            opc,
            ty,
            access: GuestAccess::default(),
            args: a,
            regs: [NO_REG; MAX_OP_ARGS],
        }
    }

    pub fn def(&self) -> &'static OpDef {
        &OPCODE_DEFS[self.opc as usize]
    }

    pub fn oargs(&self) -> &[u32] {
        &self.args[..self.def().nb_oargs as usize]
    }

    pub fn iargs(&self) -> &[u32] {
        let d = self.def();
        let start = d.nb_oargs as usize;
        &self.args[start..start + d.nb_iargs as usize]
    }

    pub fn iargs_mut(&mut self) -> &mut [u32] {
        let d = self.def();
        let start = d.nb_oargs as usize;
        &mut self.args[start..start + d.nb_iargs as usize]
    }

    pub fn cargs(&self) -> &[u32] {
        let d = self.def();
        let start = (d.nb_oargs + d.nb_iargs) as usize;
        &self.args[start..start + d.nb_cargs as usize]
    }
}

impl OpDef {
    pub const fn nb_args(&self) -> usize {
        (self.nb_oargs + self.nb_iargs + self.nb_cargs) as usize
    }
}

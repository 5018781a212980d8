use std::collections::HashMap;

use crate::op::{GuestAccess, Op, Opcode};
use crate::types::{Cond, MemSize, Type};

/// Index into the builder's temp pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempIdx(pub u32);

/// A value produced during translation. Constants are pooled and
/// deduplicated; everything else is defined exactly once by the op
/// that produces it.
#[derive(Debug, Clone)]
pub struct Temp {
    pub idx: TempIdx,
    pub ty: Type,
    pub is_const: bool,
    /// Immediate value for const temps.
    pub val: u64,
}

/// Builder and container for one translation unit's IR.
pub struct IrBuilder {
    ops: Vec<Op>,
    temps: Vec<Temp>,
    const_table: HashMap<(Type, u64), TempIdx>,
    /// Spill slots required by the block, set by register allocation.
    pub num_slots: u16,
}

impl IrBuilder {
    pub fn new() -> Self {
        Self {
            ops: Vec::with_capacity(64),
            temps: Vec::with_capacity(32),
            const_table: HashMap::new(),
            num_slots: 0,
        }
    }

    // -- Temps --

    pub fn new_temp(&mut self, ty: Type) -> TempIdx {
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(Temp {
            idx,
            ty,
            is_const: false,
            val: 0,
        });
        idx
    }

    /// Get or create a constant temp (deduplicated per type).
    pub fn new_const(&mut self, ty: Type, val: u64) -> TempIdx {
        if let Some(&t) = self.const_table.get(&(ty, val)) {
            return t;
        }
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(Temp {
            idx,
            ty,
            is_const: true,
            val,
        });
        self.const_table.insert((ty, val), idx);
        idx
    }

    pub fn temp(&self, idx: TempIdx) -> &Temp {
        &self.temps[idx.0 as usize]
    }

    pub fn temps(&self) -> &[Temp] {
        &self.temps
    }

    pub fn nb_temps(&self) -> u32 {
        self.temps.len() as u32
    }

    // -- Ops --

    pub fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut Vec<Op> {
        &mut self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn last_op(&self) -> Option<&Op> {
        self.ops.last()
    }

    // -- ALU --

    fn alu2(&mut self, opc: Opcode, a: TempIdx, b: TempIdx) -> TempIdx {
        let ty = self.temp(a).ty;
        let d = self.new_temp(ty);
        self.emit(Op::new(opc, ty, &[d.0, a.0, b.0]));
        d
    }

    fn alu1(&mut self, opc: Opcode, s: TempIdx) -> TempIdx {
        let ty = self.temp(s).ty;
        let d = self.new_temp(ty);
        self.emit(Op::new(opc, ty, &[d.0, s.0]));
        d
    }

    pub fn gen_add(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Add, a, b)
    }

    pub fn gen_sub(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Sub, a, b)
    }

    pub fn gen_and(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::And, a, b)
    }

    pub fn gen_or(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Or, a, b)
    }

    pub fn gen_xor(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Xor, a, b)
    }

    pub fn gen_shl(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Shl, a, b)
    }

    pub fn gen_shr(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Shr, a, b)
    }

    pub fn gen_sar(&mut self, a: TempIdx, b: TempIdx) -> TempIdx {
        self.alu2(Opcode::Sar, a, b)
    }

    pub fn gen_not(&mut self, s: TempIdx) -> TempIdx {
        self.alu1(Opcode::Not, s)
    }

    pub fn gen_neg(&mut self, s: TempIdx) -> TempIdx {
        self.alu1(Opcode::Neg, s)
    }

    pub fn gen_mov(&mut self, s: TempIdx) -> TempIdx {
        self.alu1(Opcode::Mov, s)
    }

    /// d = (a cond b) ? 1 : 0
    pub fn gen_setcond(&mut self, cond: Cond, a: TempIdx, b: TempIdx) -> TempIdx {
        let ty = self.temp(a).ty;
        let d = self.new_temp(ty);
        self.emit(Op::new(Opcode::SetCond, ty, &[d.0, a.0, b.0, cond as u32]));
        d
    }

    // -- Context access --

    pub fn gen_load_ctx(&mut self, ty: Type, offset: u32) -> TempIdx {
        let d = self.new_temp(ty);
        self.emit(Op::new(Opcode::LoadCtx, ty, &[d.0, offset]));
        d
    }

    pub fn gen_store_ctx(&mut self, offset: u32, s: TempIdx) {
        let ty = self.temp(s).ty;
        self.emit(Op::new(Opcode::StoreCtx, ty, &[s.0, offset]));
    }

    // -- Guest memory --

    pub fn gen_load_guest(
        &mut self,
        size: MemSize,
        signed: bool,
        fastmem: bool,
        addr: TempIdx,
    ) -> TempIdx {
        let ty = match size {
            MemSize::S64 => Type::I64,
            _ => Type::I32,
        };
        let d = self.new_temp(ty);
        let mut op = Op::new(Opcode::LoadGuest, ty, &[d.0, addr.0]);
        op.access = GuestAccess::new(size, signed, fastmem);
        self.emit(op);
        d
    }

    pub fn gen_store_guest(
        &mut self,
        size: MemSize,
        fastmem: bool,
        addr: TempIdx,
        s: TempIdx,
    ) {
        let ty = self.temp(s).ty;
        let mut op = Op::new(Opcode::StoreGuest, ty, &[addr.0, s.0]);
        op.access = GuestAccess::new(size, false, fastmem);
        self.emit(op);
    }

    // -- Exits --

    /// Store `target` to the guest PC (context offset `pc_off`) and
    /// leave the block.
    pub fn gen_branch(&mut self, target: u32, pc_off: u32) {
        self.emit(Op::new(Opcode::Branch, Type::I32, &[target, pc_off]));
    }

    /// If `cond != 0`, store `target` to the guest PC and leave.
    pub fn gen_branch_cond(&mut self, cond: TempIdx, target: u32, pc_off: u32) {
        self.emit(Op::new(
            Opcode::BranchCond,
            Type::I32,
            &[cond.0, target, pc_off],
        ));
    }

    /// Store the computed `addr` to the guest PC and leave.
    pub fn gen_branch_ind(&mut self, addr: TempIdx, pc_off: u32) {
        self.emit(Op::new(Opcode::BranchInd, Type::I32, &[addr.0, pc_off]));
    }

    // -- Fallback --

    /// Call `handler(ctx, guest_addr, raw)`, the interpreter path for
    /// instructions the translators do not cover.
    pub fn gen_fallback(&mut self, handler: usize, guest_addr: u32, raw: u16) {
        self.emit(Op::new(
            Opcode::Fallback,
            Type::I32,
            &[
                handler as u32,
                (handler as u64 >> 32) as u32,
                guest_addr,
                raw as u32,
            ],
        ));
    }
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

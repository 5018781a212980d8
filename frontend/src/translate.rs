//! Per-opcode IR translators.
//!
//! Every guest register access round-trips through the context; the
//! load/store elimination pass cleans the redundancy up afterwards.
//! Delayed branches compute their target (and link register) before
//! translating the delay-slot instruction, then emit the transfer, so
//! a delay slot that clobbers the branch's source register behaves
//! like hardware.

use sh4jit_core::types::{Cond, MemSize, Type};
use sh4jit_core::{IrBuilder, TempIdx};

use crate::context::{
    fr_offset, r_offset, xf_offset, FPSCR_MASK, FPSCR_OFFSET, FPSCR_SZ,
    PC_OFFSET, PR_OFFSET, SR_MASK, SR_OFFSET,
};
use crate::opdef::{get_opdef, Instr, OpdefFlags};
use crate::{BlockFlags, Sh4Guest};

/// Translation state threaded through the per-opcode callbacks.
pub struct Tr<'a> {
    pub guest: &'a Sh4Guest,
    pub ir: &'a mut IrBuilder,
    pub flags: BlockFlags,
}

impl Tr<'_> {
    fn fastmem(&self) -> bool {
        self.flags.contains(BlockFlags::FASTMEM)
    }

    fn sz64(&self) -> bool {
        self.flags.contains(BlockFlags::DOUBLE_SZ)
    }

    fn konst(&mut self, v: u32) -> TempIdx {
        self.ir.new_const(Type::I32, v as u64)
    }

    fn load_r(&mut self, n: usize) -> TempIdx {
        self.ir.gen_load_ctx(Type::I32, r_offset(n))
    }

    fn store_r(&mut self, n: usize, v: TempIdx) {
        self.ir.gen_store_ctx(r_offset(n), v);
    }

    /// T as a 0/1 value.
    fn load_t(&mut self) -> TempIdx {
        let sr = self.ir.gen_load_ctx(Type::I32, SR_OFFSET);
        let one = self.konst(1);
        self.ir.gen_and(sr, one)
    }

    /// Write a 0/1 value into SR.T.
    fn store_t(&mut self, t: TempIdx) {
        let sr = self.ir.gen_load_ctx(Type::I32, SR_OFFSET);
        let mask = self.konst(!1u32);
        let cleared = self.ir.gen_and(sr, mask);
        let merged = self.ir.gen_or(cleared, t);
        self.ir.gen_store_ctx(SR_OFFSET, merged);
    }

    /// Emit the interpreter fallback call for `raw` at `addr`.
    pub(crate) fn fallback(&mut self, addr: u32, raw: u16) {
        self.ir
            .gen_fallback(self.guest.fallback as usize, addr, raw);
    }

    /// Translate a single instruction (used for delay slots).
    pub(crate) fn translate_one(&mut self, addr: u32) {
        let raw = self.guest.mem.read16(addr);
        match get_opdef(raw) {
            Some(def)
                if !def
                    .flags
                    .intersects(OpdefFlags::INVALID | OpdefFlags::DELAYED) =>
            {
                (def.translate)(self, addr, Instr(raw));
            }
            // Invalid word, or a delayed branch where one cannot be:
            // hand it to the interpreter, which raises the guest
            // illegal-instruction exception.
            _ => self.fallback(addr, raw),
        }
    }

    fn delay_slot(&mut self, addr: u32) {
        self.translate_one(addr);
    }

    /// Context offset of the FR/XF pair addressed by a 64-bit FMOV.
    fn pair_offset(n: usize) -> u32 {
        if n & 1 == 0 {
            fr_offset(n)
        } else {
            xf_offset(n & !1)
        }
    }
}

// ── Moves and ALU ──────────────────────────────────────────────

pub(crate) fn tr_nop(_t: &mut Tr, _addr: u32, _i: Instr) {}

pub(crate) fn tr_mov_imm(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.konst(i.imm_s8() as u32);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_mov_rr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rm());
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_add(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let v = t.ir.gen_add(a, b);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_add_imm(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.konst(i.imm_s8() as u32);
    let v = t.ir.gen_add(a, b);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_sub(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let v = t.ir.gen_sub(a, b);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_and(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let v = t.ir.gen_and(a, b);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_or(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let v = t.ir.gen_or(a, b);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_xor(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let v = t.ir.gen_xor(a, b);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_not(t: &mut Tr, _addr: u32, i: Instr) {
    let s = t.load_r(i.rm());
    let v = t.ir.gen_not(s);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_neg(t: &mut Tr, _addr: u32, i: Instr) {
    let s = t.load_r(i.rm());
    let v = t.ir.gen_neg(s);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_extu_b(t: &mut Tr, _addr: u32, i: Instr) {
    let s = t.load_r(i.rm());
    let m = t.konst(0xFF);
    let v = t.ir.gen_and(s, m);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_extu_w(t: &mut Tr, _addr: u32, i: Instr) {
    let s = t.load_r(i.rm());
    let m = t.konst(0xFFFF);
    let v = t.ir.gen_and(s, m);
    t.store_r(i.rn(), v);
}

fn exts(t: &mut Tr, i: Instr, bits: u32) {
    let s = t.load_r(i.rm());
    let sh = t.konst(32 - bits);
    let hi = t.ir.gen_shl(s, sh);
    let v = t.ir.gen_sar(hi, sh);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_exts_b(t: &mut Tr, _addr: u32, i: Instr) {
    exts(t, i, 8);
}

pub(crate) fn tr_exts_w(t: &mut Tr, _addr: u32, i: Instr) {
    exts(t, i, 16);
}

// ── Shifts ─────────────────────────────────────────────────────

pub(crate) fn tr_shll(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let sh31 = t.konst(31);
    let msb = t.ir.gen_shr(v, sh31);
    t.store_t(msb);
    let one = t.konst(1);
    let shifted = t.ir.gen_shl(v, one);
    t.store_r(i.rn(), shifted);
}

pub(crate) fn tr_shlr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let one = t.konst(1);
    let lsb = t.ir.gen_and(v, one);
    t.store_t(lsb);
    let shifted = t.ir.gen_shr(v, one);
    t.store_r(i.rn(), shifted);
}

pub(crate) fn tr_shar(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let one = t.konst(1);
    let lsb = t.ir.gen_and(v, one);
    t.store_t(lsb);
    let shifted = t.ir.gen_sar(v, one);
    t.store_r(i.rn(), shifted);
}

/// Shift count from the encoding: 4x08/4x18/4x28 are 2/8/16.
fn shift_count(i: Instr) -> u32 {
    match (i.0 >> 4) & 0x3 {
        0 => 2,
        1 => 8,
        _ => 16,
    }
}

pub(crate) fn tr_shll_n(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let sh = t.konst(shift_count(i));
    let shifted = t.ir.gen_shl(v, sh);
    t.store_r(i.rn(), shifted);
}

pub(crate) fn tr_shlr_n(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let sh = t.konst(shift_count(i));
    let shifted = t.ir.gen_shr(v, sh);
    t.store_r(i.rn(), shifted);
}

// ── Comparisons ────────────────────────────────────────────────

fn cmp(t: &mut Tr, i: Instr, cond: Cond) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let r = t.ir.gen_setcond(cond, a, b);
    t.store_t(r);
}

pub(crate) fn tr_cmp_eq(t: &mut Tr, _addr: u32, i: Instr) {
    cmp(t, i, Cond::Eq);
}

pub(crate) fn tr_cmp_hs(t: &mut Tr, _addr: u32, i: Instr) {
    cmp(t, i, Cond::Hs);
}

pub(crate) fn tr_cmp_ge(t: &mut Tr, _addr: u32, i: Instr) {
    cmp(t, i, Cond::Ge);
}

pub(crate) fn tr_cmp_hi(t: &mut Tr, _addr: u32, i: Instr) {
    cmp(t, i, Cond::Hi);
}

pub(crate) fn tr_cmp_gt(t: &mut Tr, _addr: u32, i: Instr) {
    cmp(t, i, Cond::Gt);
}

pub(crate) fn tr_cmp_eq_imm(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(0);
    let b = t.konst(i.imm_s8() as u32);
    let r = t.ir.gen_setcond(Cond::Eq, a, b);
    t.store_t(r);
}

pub(crate) fn tr_tst(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let b = t.load_r(i.rm());
    let masked = t.ir.gen_and(a, b);
    let zero = t.konst(0);
    let r = t.ir.gen_setcond(Cond::Eq, masked, zero);
    t.store_t(r);
}

pub(crate) fn tr_movt(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_t();
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_dt(t: &mut Tr, _addr: u32, i: Instr) {
    let a = t.load_r(i.rn());
    let one = t.konst(1);
    let v = t.ir.gen_sub(a, one);
    t.store_r(i.rn(), v);
    let zero = t.konst(0);
    let r = t.ir.gen_setcond(Cond::Eq, v, zero);
    t.store_t(r);
}

// ── Loads and stores ───────────────────────────────────────────

/// mov.{b,w,l} @Rm,Rn; size comes from the low opcode bits.
pub(crate) fn tr_mov_load(t: &mut Tr, _addr: u32, i: Instr) {
    let size = MemSize::from_log2(i.0 as u8);
    let addr = t.load_r(i.rm());
    let fm = t.fastmem();
    let v = t.ir.gen_load_guest(size, true, fm, addr);
    t.store_r(i.rn(), v);
}

/// mov.{b,w,l} Rm,@Rn.
pub(crate) fn tr_mov_store(t: &mut Tr, _addr: u32, i: Instr) {
    let size = MemSize::from_log2(i.0 as u8);
    let addr = t.load_r(i.rn());
    let v = t.load_r(i.rm());
    let fm = t.fastmem();
    t.ir.gen_store_guest(size, fm, addr, v);
}

pub(crate) fn tr_movl_disp_load(t: &mut Tr, _addr: u32, i: Instr) {
    let base = t.load_r(i.rm());
    let disp = t.konst(i.disp4() * 4);
    let addr = t.ir.gen_add(base, disp);
    let fm = t.fastmem();
    let v = t.ir.gen_load_guest(MemSize::S32, false, fm, addr);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_movl_disp_store(t: &mut Tr, _addr: u32, i: Instr) {
    let base = t.load_r(i.rn());
    let disp = t.konst(i.disp4() * 4);
    let addr = t.ir.gen_add(base, disp);
    let v = t.load_r(i.rm());
    let fm = t.fastmem();
    t.ir.gen_store_guest(MemSize::S32, fm, addr, v);
}

pub(crate) fn tr_movl_postinc(t: &mut Tr, _addr: u32, i: Instr) {
    let addr = t.load_r(i.rm());
    let fm = t.fastmem();
    let v = t.ir.gen_load_guest(MemSize::S32, false, fm, addr);
    let four = t.konst(4);
    let next = t.ir.gen_add(addr, four);
    t.store_r(i.rm(), next);
    // When m == n the loaded value wins.
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_movl_predec(t: &mut Tr, _addr: u32, i: Instr) {
    // The stored value is Rm before the decrement.
    let v = t.load_r(i.rm());
    let base = t.load_r(i.rn());
    let four = t.konst(4);
    let addr = t.ir.gen_sub(base, four);
    t.store_r(i.rn(), addr);
    let fm = t.fastmem();
    t.ir.gen_store_guest(MemSize::S32, fm, addr, v);
}

pub(crate) fn tr_movw_pc(t: &mut Tr, addr: u32, i: Instr) {
    let ea = t.konst(addr.wrapping_add(4).wrapping_add(i.disp8() * 2));
    let fm = t.fastmem();
    let v = t.ir.gen_load_guest(MemSize::S16, true, fm, ea);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_movl_pc(t: &mut Tr, addr: u32, i: Instr) {
    let ea = t.konst((addr & !3).wrapping_add(4).wrapping_add(i.disp8() * 4));
    let fm = t.fastmem();
    let v = t.ir.gen_load_guest(MemSize::S32, false, fm, ea);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_mova(t: &mut Tr, addr: u32, i: Instr) {
    let v = t.konst((addr & !3).wrapping_add(4).wrapping_add(i.disp8() * 4));
    t.store_r(0, v);
}

// ── Control registers ──────────────────────────────────────────

pub(crate) fn tr_sts_pr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.ir.gen_load_ctx(Type::I32, PR_OFFSET);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_lds_pr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    t.ir.gen_store_ctx(PR_OFFSET, v);
}

pub(crate) fn tr_stc_sr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.ir.gen_load_ctx(Type::I32, SR_OFFSET);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_ldc_sr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let mask = t.konst(SR_MASK);
    let masked = t.ir.gen_and(v, mask);
    t.ir.gen_store_ctx(SR_OFFSET, masked);
}

pub(crate) fn tr_sts_fpscr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.ir.gen_load_ctx(Type::I32, FPSCR_OFFSET);
    t.store_r(i.rn(), v);
}

pub(crate) fn tr_lds_fpscr(t: &mut Tr, _addr: u32, i: Instr) {
    let v = t.load_r(i.rn());
    let mask = t.konst(FPSCR_MASK);
    let masked = t.ir.gen_and(v, mask);
    t.ir.gen_store_ctx(FPSCR_OFFSET, masked);
}

pub(crate) fn tr_fschg(t: &mut Tr, _addr: u32, _i: Instr) {
    let v = t.ir.gen_load_ctx(Type::I32, FPSCR_OFFSET);
    let bit = t.konst(FPSCR_SZ);
    let flipped = t.ir.gen_xor(v, bit);
    t.ir.gen_store_ctx(FPSCR_OFFSET, flipped);
}

// ── Branches ───────────────────────────────────────────────────

pub(crate) fn tr_bra(t: &mut Tr, addr: u32, i: Instr) {
    let target = addr
        .wrapping_add(4)
        .wrapping_add((i.disp_s12() * 2) as u32);
    t.delay_slot(addr + 2);
    t.ir.gen_branch(target, PC_OFFSET);
}

pub(crate) fn tr_bsr(t: &mut Tr, addr: u32, i: Instr) {
    let target = addr
        .wrapping_add(4)
        .wrapping_add((i.disp_s12() * 2) as u32);
    let link = t.konst(addr.wrapping_add(4));
    t.ir.gen_store_ctx(PR_OFFSET, link);
    t.delay_slot(addr + 2);
    t.ir.gen_branch(target, PC_OFFSET);
}

pub(crate) fn tr_bt(t: &mut Tr, addr: u32, i: Instr) {
    let target = addr
        .wrapping_add(4)
        .wrapping_add((i.disp_s8() * 2) as u32);
    let cond = t.load_t();
    t.ir.gen_branch_cond(cond, target, PC_OFFSET);
}

pub(crate) fn tr_bf(t: &mut Tr, addr: u32, i: Instr) {
    let target = addr
        .wrapping_add(4)
        .wrapping_add((i.disp_s8() * 2) as u32);
    let tval = t.load_t();
    let zero = t.konst(0);
    let cond = t.ir.gen_setcond(Cond::Eq, tval, zero);
    t.ir.gen_branch_cond(cond, target, PC_OFFSET);
}

pub(crate) fn tr_bts(t: &mut Tr, addr: u32, i: Instr) {
    let target = addr
        .wrapping_add(4)
        .wrapping_add((i.disp_s8() * 2) as u32);
    // T before the delay slot decides the branch.
    let cond = t.load_t();
    t.delay_slot(addr + 2);
    t.ir.gen_branch_cond(cond, target, PC_OFFSET);
}

pub(crate) fn tr_bfs(t: &mut Tr, addr: u32, i: Instr) {
    let target = addr
        .wrapping_add(4)
        .wrapping_add((i.disp_s8() * 2) as u32);
    let tval = t.load_t();
    let zero = t.konst(0);
    let cond = t.ir.gen_setcond(Cond::Eq, tval, zero);
    t.delay_slot(addr + 2);
    t.ir.gen_branch_cond(cond, target, PC_OFFSET);
}

pub(crate) fn tr_jmp(t: &mut Tr, addr: u32, i: Instr) {
    let target = t.load_r(i.rn());
    t.delay_slot(addr + 2);
    t.ir.gen_branch_ind(target, PC_OFFSET);
}

pub(crate) fn tr_jsr(t: &mut Tr, addr: u32, i: Instr) {
    let target = t.load_r(i.rn());
    let link = t.konst(addr.wrapping_add(4));
    t.ir.gen_store_ctx(PR_OFFSET, link);
    t.delay_slot(addr + 2);
    t.ir.gen_branch_ind(target, PC_OFFSET);
}

pub(crate) fn tr_rts(t: &mut Tr, addr: u32, _i: Instr) {
    let target = t.ir.gen_load_ctx(Type::I32, PR_OFFSET);
    t.delay_slot(addr + 2);
    t.ir.gen_branch_ind(target, PC_OFFSET);
}

pub(crate) fn tr_braf(t: &mut Tr, addr: u32, i: Instr) {
    let base = t.konst(addr.wrapping_add(4));
    let off = t.load_r(i.rn());
    let target = t.ir.gen_add(off, base);
    t.delay_slot(addr + 2);
    t.ir.gen_branch_ind(target, PC_OFFSET);
}

pub(crate) fn tr_bsrf(t: &mut Tr, addr: u32, i: Instr) {
    let base = t.konst(addr.wrapping_add(4));
    let off = t.load_r(i.rn());
    let target = t.ir.gen_add(off, base);
    t.ir.gen_store_ctx(PR_OFFSET, base);
    t.delay_slot(addr + 2);
    t.ir.gen_branch_ind(target, PC_OFFSET);
}

/// RTE restores SR/PC from SSR/SPC; the interpreter owns that state
/// transition, so the delay slot runs and the rest is a fallback.
pub(crate) fn tr_rte(t: &mut Tr, addr: u32, i: Instr) {
    t.delay_slot(addr + 2);
    t.fallback(addr, i.0);
}

// ── Floating point ─────────────────────────────────────────────

pub(crate) fn tr_fmov_load(t: &mut Tr, _addr: u32, i: Instr) {
    let addr = t.load_r(i.rm());
    let fm = t.fastmem();
    if t.sz64() {
        let v = t.ir.gen_load_guest(MemSize::S64, false, fm, addr);
        t.ir.gen_store_ctx(Tr::pair_offset(i.rn()), v);
    } else {
        let v = t.ir.gen_load_guest(MemSize::S32, false, fm, addr);
        t.ir.gen_store_ctx(fr_offset(i.rn()), v);
    }
}

pub(crate) fn tr_fmov_store(t: &mut Tr, _addr: u32, i: Instr) {
    let addr = t.load_r(i.rn());
    let fm = t.fastmem();
    if t.sz64() {
        let v = t.ir.gen_load_ctx(Type::I64, Tr::pair_offset(i.rm()));
        t.ir.gen_store_guest(MemSize::S64, fm, addr, v);
    } else {
        let v = t.ir.gen_load_ctx(Type::I32, fr_offset(i.rm()));
        t.ir.gen_store_guest(MemSize::S32, fm, addr, v);
    }
}

pub(crate) fn tr_fmov_rr(t: &mut Tr, _addr: u32, i: Instr) {
    if t.sz64() {
        let v = t.ir.gen_load_ctx(Type::I64, Tr::pair_offset(i.rm()));
        t.ir.gen_store_ctx(Tr::pair_offset(i.rn()), v);
    } else {
        let v = t.ir.gen_load_ctx(Type::I32, fr_offset(i.rm()));
        t.ir.gen_store_ctx(fr_offset(i.rn()), v);
    }
}

/// FP arithmetic goes through the interpreter; the helper reads FPSCR
/// at run time, so PR-width selection happens there.
pub(crate) fn tr_fp_fallback(t: &mut Tr, addr: u32, i: Instr) {
    t.fallback(addr, i.0);
}

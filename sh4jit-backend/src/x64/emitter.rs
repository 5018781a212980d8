//! x86-64 instruction encoding helpers.
//!
//! Every helper appends one instruction to the arena. Register
//! arguments are ModR/M codes (see `regs.rs`). 32-bit forms are used
//! for `Type::I32` so results are implicitly zero-extended to 64 bits.

use sh4jit_core::types::{MemSize, Type};

use crate::arena::CodeArena;
use crate::x64::regs::{is_ext, low3, MEMBASE_REG, RBP, RSP};

/// Emit a REX prefix if any of its bits are needed.
#[inline]
fn rex(buf: &mut CodeArena, w: bool, r: u8, x: u8, b: u8) {
    let mut byte = 0x40u8;
    if w {
        byte |= 0x08;
    }
    if is_ext(r) {
        byte |= 0x04;
    }
    if is_ext(x) {
        byte |= 0x02;
    }
    if is_ext(b) {
        byte |= 0x01;
    }
    if byte != 0x40 {
        buf.emit_u8(byte);
    }
}

#[inline]
fn rex_ty(buf: &mut CodeArena, ty: Type, r: u8, x: u8, b: u8) {
    rex(buf, ty == Type::I64, r, x, b);
}

#[inline]
fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | (low3(reg) << 3) | low3(rm)
}

// -- Push/pop/ret --

pub fn emit_push(buf: &mut CodeArena, reg: u8) {
    if is_ext(reg) {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x50 + low3(reg));
}

pub fn emit_pop(buf: &mut CodeArena, reg: u8) {
    if is_ext(reg) {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x58 + low3(reg));
}

pub fn emit_ret(buf: &mut CodeArena) {
    buf.emit_u8(0xC3);
}

// -- Register moves --

/// mov dst, src (register to register).
pub fn emit_mov_rr(buf: &mut CodeArena, ty: Type, dst: u8, src: u8) {
    rex_ty(buf, ty, src, 0, dst);
    buf.emit_u8(0x89); // MOV r/m, r
    buf.emit_u8(modrm(0b11, src, dst));
}

/// mov dst, imm. Chooses xor / mov r32 / movabs by value and type.
pub fn emit_mov_ri(buf: &mut CodeArena, ty: Type, dst: u8, val: u64) {
    if val == 0 {
        // xor dst32, dst32 zero-extends.
        rex(buf, false, dst, 0, dst);
        buf.emit_u8(0x31);
        buf.emit_u8(modrm(0b11, dst, dst));
    } else if ty == Type::I32 || val <= u32::MAX as u64 {
        rex(buf, false, 0, 0, dst);
        buf.emit_u8(0xB8 + low3(dst));
        buf.emit_u32(val as u32);
    } else {
        rex(buf, true, 0, 0, dst);
        buf.emit_u8(0xB8 + low3(dst));
        buf.emit_u64(val);
    }
}

// -- ALU --

/// Two-operand ALU in RM form: `op dst, src`.
/// `opcode` is the RM-form byte (add=0x03, sub=0x2B, and=0x23,
/// or=0x0B, xor=0x33, cmp=0x3B).
pub fn emit_alu_rr(buf: &mut CodeArena, ty: Type, opcode: u8, dst: u8, src: u8) {
    rex_ty(buf, ty, dst, 0, src);
    buf.emit_u8(opcode);
    buf.emit_u8(modrm(0b11, dst, src));
}

/// `op dst, imm32` via 0x81 /ext (add=0, or=1, and=4, sub=5, xor=6,
/// cmp=7).
pub fn emit_alu_ri(buf: &mut CodeArena, ty: Type, ext: u8, dst: u8, imm: u32) {
    rex_ty(buf, ty, 0, 0, dst);
    buf.emit_u8(0x81);
    buf.emit_u8(modrm(0b11, ext, dst));
    buf.emit_u32(imm);
}

/// `add dst32, imm8` (0x83 /0), for small address adjustments.
pub fn emit_add_ri8(buf: &mut CodeArena, dst: u8, imm: i8) {
    rex(buf, false, 0, 0, dst);
    buf.emit_u8(0x83);
    buf.emit_u8(modrm(0b11, 0, dst));
    buf.emit_u8(imm as u8);
}

/// Shift by constant via 0xC1 /ext (shl=4, shr=5, sar=7).
pub fn emit_shift_ri(buf: &mut CodeArena, ty: Type, ext: u8, dst: u8, imm: u8) {
    rex_ty(buf, ty, 0, 0, dst);
    buf.emit_u8(0xC1);
    buf.emit_u8(modrm(0b11, ext, dst));
    buf.emit_u8(imm);
}

/// Unary group 0xF7 /ext (not=2, neg=3).
pub fn emit_unary(buf: &mut CodeArena, ty: Type, ext: u8, reg: u8) {
    rex_ty(buf, ty, 0, 0, reg);
    buf.emit_u8(0xF7);
    buf.emit_u8(modrm(0b11, ext, reg));
}

/// test a, b (32-bit).
pub fn emit_test_rr32(buf: &mut CodeArena, a: u8, b: u8) {
    rex(buf, false, b, 0, a);
    buf.emit_u8(0x85);
    buf.emit_u8(modrm(0b11, b, a));
}

/// setcc al. `cc` is the condition nibble of the 0x0F 0x90+cc opcode.
pub fn emit_setcc_al(buf: &mut CodeArena, cc: u8) {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x90 + cc);
    buf.emit_u8(0xC0);
}

/// movzx eax, al.
pub fn emit_movzx_eax_al(buf: &mut CodeArena) {
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB6);
    buf.emit_u8(0xC0);
}

// -- Context (RBP-relative) access --

#[inline]
fn modrm_disp32(buf: &mut CodeArena, reg: u8, base: u8) {
    buf.emit_u8(modrm(0b10, reg, base));
    if low3(base) == 0b100 {
        buf.emit_u8(0x24); // SIB: no index, base = base
    }
}

/// mov dst, [rbp + disp].
pub fn emit_ld_ctx(buf: &mut CodeArena, ty: Type, dst: u8, disp: u32) {
    rex_ty(buf, ty, dst, 0, RBP);
    buf.emit_u8(0x8B);
    modrm_disp32(buf, dst, RBP);
    buf.emit_u32(disp);
}

/// mov [rbp + disp], src.
pub fn emit_st_ctx(buf: &mut CodeArena, ty: Type, src: u8, disp: u32) {
    rex_ty(buf, ty, src, 0, RBP);
    buf.emit_u8(0x89);
    modrm_disp32(buf, src, RBP);
    buf.emit_u32(disp);
}

/// mov dword [rbp + disp], imm32.
pub fn emit_st_ctx_imm32(buf: &mut CodeArena, disp: u32, imm: u32) {
    buf.emit_u8(0xC7);
    modrm_disp32(buf, 0, RBP);
    buf.emit_u32(disp);
    buf.emit_u32(imm);
}

// -- Spill slot (RSP-relative, always 64-bit) access --

pub fn emit_ld_slot(buf: &mut CodeArena, dst: u8, disp: u32) {
    rex(buf, true, dst, 0, RSP);
    buf.emit_u8(0x8B);
    modrm_disp32(buf, dst, RSP);
    buf.emit_u32(disp);
}

pub fn emit_st_slot(buf: &mut CodeArena, src: u8, disp: u32) {
    rex(buf, true, src, 0, RSP);
    buf.emit_u8(0x89);
    modrm_disp32(buf, src, RSP);
    buf.emit_u32(disp);
}

// -- Fastmem access: [MEMBASE + idx], fixed shapes --
//
// The fault classifier decodes exactly what these emit; keep the two
// in sync.

#[inline]
fn sib_membase(buf: &mut CodeArena, reg: u8, idx: u8) {
    buf.emit_u8(modrm(0b00, reg, 0b100));
    buf.emit_u8((low3(idx) << 3) | low3(MEMBASE_REG));
}

/// Load from guest memory: movsx/movzx/mov dst, [membase + idx].
pub fn emit_fastmem_load(
    buf: &mut CodeArena,
    size: MemSize,
    signed: bool,
    dst: u8,
    idx: u8,
) {
    match size {
        MemSize::S8 | MemSize::S16 => {
            rex(buf, false, dst, idx, MEMBASE_REG);
            buf.emit_u8(0x0F);
            let op = match (size, signed) {
                (MemSize::S8, false) => 0xB6,  // movzx r32, m8
                (MemSize::S8, true) => 0xBE,   // movsx r32, m8
                (MemSize::S16, false) => 0xB7, // movzx r32, m16
                _ => 0xBF,                     // movsx r32, m16
            };
            buf.emit_u8(op);
            sib_membase(buf, dst, idx);
        }
        MemSize::S32 => {
            rex(buf, false, dst, idx, MEMBASE_REG);
            buf.emit_u8(0x8B);
            sib_membase(buf, dst, idx);
        }
        MemSize::S64 => {
            rex(buf, true, dst, idx, MEMBASE_REG);
            buf.emit_u8(0x8B);
            sib_membase(buf, dst, idx);
        }
    }
}

/// Store to guest memory: mov [membase + idx], src.
pub fn emit_fastmem_store(
    buf: &mut CodeArena,
    size: MemSize,
    src: u8,
    idx: u8,
) {
    match size {
        MemSize::S8 => {
            rex(buf, false, src, idx, MEMBASE_REG);
            buf.emit_u8(0x88);
            sib_membase(buf, src, idx);
        }
        MemSize::S16 => {
            buf.emit_u8(0x66);
            rex(buf, false, src, idx, MEMBASE_REG);
            buf.emit_u8(0x89);
            sib_membase(buf, src, idx);
        }
        MemSize::S32 => {
            rex(buf, false, src, idx, MEMBASE_REG);
            buf.emit_u8(0x89);
            sib_membase(buf, src, idx);
        }
        MemSize::S64 => {
            rex(buf, true, src, idx, MEMBASE_REG);
            buf.emit_u8(0x89);
            sib_membase(buf, src, idx);
        }
    }
}

// -- Control flow --

/// jmp rel32 with a zero placeholder; returns the offset of the rel32
/// field for later patching.
pub fn emit_jmp_rel32(buf: &mut CodeArena) -> usize {
    buf.emit_u8(0xE9);
    let site = buf.offset();
    buf.emit_u32(0);
    site
}

/// jz rel8 (short skip over a fixed-length sequence).
pub fn emit_jz_rel8(buf: &mut CodeArena, disp: u8) {
    buf.emit_u8(0x74);
    buf.emit_u8(disp);
}

/// call rax.
pub fn emit_call_rax(buf: &mut CodeArena) {
    buf.emit_u8(0xFF);
    buf.emit_u8(0xD0);
}

/// sub rsp, imm32.
pub fn emit_sub_rsp(buf: &mut CodeArena, imm: u32) {
    if imm == 0 {
        return;
    }
    buf.emit_u8(0x48);
    buf.emit_u8(0x81);
    buf.emit_u8(0xEC);
    buf.emit_u32(imm);
}

/// add rsp, imm32.
pub fn emit_add_rsp(buf: &mut CodeArena, imm: u32) {
    if imm == 0 {
        return;
    }
    buf.emit_u8(0x48);
    buf.emit_u8(0x81);
    buf.emit_u8(0xC4);
    buf.emit_u32(imm);
}

/// movsx/movzx dst32, al/ax: widen a slow-path helper result.
pub fn emit_extend_from_eax(
    buf: &mut CodeArena,
    size: MemSize,
    signed: bool,
    dst: u8,
) {
    match size {
        MemSize::S8 | MemSize::S16 => {
            rex(buf, false, dst, 0, 0);
            buf.emit_u8(0x0F);
            let op = match (size, signed) {
                (MemSize::S8, false) => 0xB6,
                (MemSize::S8, true) => 0xBE,
                (MemSize::S16, false) => 0xB7,
                _ => 0xBF,
            };
            buf.emit_u8(op);
            buf.emit_u8(modrm(0b11, dst, 0));
        }
        _ => emit_mov_rr(buf, Type::I32, dst, 0),
    }
}

//! IR-to-host lowering.
//!
//! Each translation unit becomes a self-contained SysV function
//! `fn(*mut Sh4Context)`:
//!
//! ```text
//!   push rbp/rbx/r12/r13/r14/r15
//!   mov  rbp, rdi            ; context register
//!   movabs r15, membase      ; fastmem base
//!   sub  rsp, frame          ; spill slots + alignment
//!   ...block body...
//! epilogue:                  ; branch ops jump here
//!   add  rsp, frame
//!   pop  r15/r14/r13/r12/rbx/rbp
//!   ret
//! ```
//!
//! ALU ops are lowered through the RAX scratch so output/input
//! register aliasing never matters. Temps live in callee-saved
//! registers and survive the slow-path calls.

use sh4jit_core::op::{Op, Opcode};
use sh4jit_core::types::{Cond, MemSize, Type};
use sh4jit_core::{IrBuilder, MemoryInterface, TempIdx};

use crate::arena::CodeArena;
use crate::x64::emitter::*;
use crate::x64::regs::{CTX_REG, MEMBASE_REG, RAX, RCX, RDI, RDX, RSI, SAVED};

/// One temp argument as the lowering sees it.
enum Src {
    Reg(u8),
    Imm(u64),
}

fn src(ir: &IrBuilder, op: &Op, arg: usize) -> Src {
    let t = ir.temp(TempIdx(op.args[arg]));
    if t.is_const {
        Src::Imm(t.val)
    } else {
        let r = op.regs[arg];
        assert_ne!(r, sh4jit_core::op::NO_REG, "unallocated temp");
        Src::Reg(r)
    }
}

/// Move a source operand into `dst`.
fn mov_into(buf: &mut CodeArena, ty: Type, dst: u8, s: &Src) {
    match *s {
        Src::Reg(r) => {
            if r != dst {
                emit_mov_rr(buf, ty, dst, r);
            }
        }
        Src::Imm(v) => emit_mov_ri(buf, ty, dst, v),
    }
}

/// Spill-area byte size: slots plus padding so RSP is 16-byte aligned
/// at every call site.
fn frame_size(num_slots: u16) -> u32 {
    let raw = num_slots as u32 * 8;
    if raw % 16 == 0 {
        raw + 8
    } else {
        raw
    }
}

pub fn assemble_unit(buf: &mut CodeArena, ir: &IrBuilder, memif: &MemoryInterface) {
    let frame = frame_size(ir.num_slots);

    // -- Prologue --
    for &reg in &SAVED {
        emit_push(buf, reg);
    }
    emit_mov_rr(buf, Type::I64, CTX_REG, RDI);
    emit_mov_ri(buf, Type::I64, MEMBASE_REG, memif.space as u64);
    emit_sub_rsp(buf, frame);

    // rel32 sites that jump to the epilogue
    let mut exit_sites: Vec<usize> = Vec::new();

    for op in ir.ops() {
        lower_op(buf, ir, memif, op, &mut exit_sites);
    }

    // -- Epilogue --
    let epilogue = buf.offset();
    for site in exit_sites {
        buf.patch_u32(site, (epilogue as i64 - (site as i64 + 4)) as u32);
    }
    emit_add_rsp(buf, frame);
    for &reg in SAVED.iter().rev() {
        emit_pop(buf, reg);
    }
    emit_ret(buf);
}

fn lower_op(
    buf: &mut CodeArena,
    ir: &IrBuilder,
    memif: &MemoryInterface,
    op: &Op,
    exit_sites: &mut Vec<usize>,
) {
    match op.opc {
        Opcode::Nop => {}

        Opcode::Mov => {
            let dst = op.regs[0];
            let s = src(ir, op, 1);
            mov_into(buf, op.ty, dst, &s);
        }

        Opcode::Add
        | Opcode::Sub
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor => {
            let (rm_opc, imm_ext) = match op.opc {
                Opcode::Add => (0x03, 0),
                Opcode::Or => (0x0B, 1),
                Opcode::And => (0x23, 4),
                Opcode::Sub => (0x2B, 5),
                _ => (0x33, 6),
            };
            let dst = op.regs[0];
            let a = src(ir, op, 1);
            let b = src(ir, op, 2);
            mov_into(buf, op.ty, RAX, &a);
            match b {
                Src::Reg(r) => emit_alu_rr(buf, op.ty, rm_opc, RAX, r),
                Src::Imm(v) => emit_alu_ri(buf, op.ty, imm_ext, RAX, v as u32),
            }
            emit_mov_rr(buf, op.ty, dst, RAX);
        }

        Opcode::Shl | Opcode::Shr | Opcode::Sar => {
            let ext = match op.opc {
                Opcode::Shl => 4,
                Opcode::Shr => 5,
                _ => 7,
            };
            let dst = op.regs[0];
            let a = src(ir, op, 1);
            let b = src(ir, op, 2);
            let Src::Imm(count) = b else {
                panic!("variable shift counts are not emitted");
            };
            mov_into(buf, op.ty, RAX, &a);
            emit_shift_ri(buf, op.ty, ext, RAX, count as u8);
            emit_mov_rr(buf, op.ty, dst, RAX);
        }

        Opcode::Not | Opcode::Neg => {
            let ext = if op.opc == Opcode::Not { 2 } else { 3 };
            let dst = op.regs[0];
            let s = src(ir, op, 1);
            mov_into(buf, op.ty, RAX, &s);
            emit_unary(buf, op.ty, ext, RAX);
            emit_mov_rr(buf, op.ty, dst, RAX);
        }

        Opcode::SetCond => {
            let dst = op.regs[0];
            let a = src(ir, op, 1);
            let b = src(ir, op, 2);
            let cond = Cond::from_raw(op.cargs()[0]);
            mov_into(buf, op.ty, RAX, &a);
            if cond == Cond::TstNe {
                match b {
                    Src::Reg(r) => emit_test_rr32(buf, RAX, r),
                    Src::Imm(v) => {
                        emit_mov_ri(buf, op.ty, RCX, v);
                        emit_test_rr32(buf, RAX, RCX);
                    }
                }
            } else {
                match b {
                    Src::Reg(r) => emit_alu_rr(buf, op.ty, 0x3B, RAX, r),
                    Src::Imm(v) => emit_alu_ri(buf, op.ty, 7, RAX, v as u32),
                }
            }
            let cc = match cond {
                Cond::Eq => 0x4,    // sete
                Cond::Gt => 0xF,    // setg
                Cond::Ge => 0xD,    // setge
                Cond::Hi => 0x7,    // seta
                Cond::Hs => 0x3,    // setae
                Cond::TstNe => 0x5, // setne
            };
            emit_setcc_al(buf, cc);
            emit_movzx_eax_al(buf);
            emit_mov_rr(buf, Type::I32, dst, RAX);
        }

        Opcode::LoadCtx => {
            emit_ld_ctx(buf, op.ty, op.regs[0], op.cargs()[0]);
        }

        Opcode::StoreCtx => {
            let off = op.cargs()[0];
            match src(ir, op, 0) {
                Src::Reg(r) => emit_st_ctx(buf, op.ty, r, off),
                Src::Imm(v) => {
                    if op.ty == Type::I32 {
                        emit_st_ctx_imm32(buf, off, v as u32);
                    } else {
                        emit_mov_ri(buf, Type::I64, RAX, v);
                        emit_st_ctx(buf, Type::I64, RAX, off);
                    }
                }
            }
        }

        Opcode::LoadGuest => lower_load_guest(buf, ir, memif, op),
        Opcode::StoreGuest => lower_store_guest(buf, ir, memif, op),

        Opcode::LoadSlot => {
            emit_ld_slot(buf, op.regs[0], op.cargs()[0] * 8);
        }

        Opcode::StoreSlot => {
            emit_st_slot(buf, op.regs[0], op.cargs()[0] * 8);
        }

        Opcode::Branch => {
            let target = op.cargs()[0];
            let pc_off = op.cargs()[1];
            emit_st_ctx_imm32(buf, pc_off, target);
            exit_sites.push(emit_jmp_rel32(buf));
        }

        Opcode::BranchCond => {
            let target = op.cargs()[0];
            let pc_off = op.cargs()[1];
            match src(ir, op, 0) {
                Src::Imm(v) => {
                    if v != 0 {
                        emit_st_ctx_imm32(buf, pc_off, target);
                        exit_sites.push(emit_jmp_rel32(buf));
                    }
                }
                Src::Reg(r) => {
                    emit_test_rr32(buf, r, r);
                    // Fall through over the taken path:
                    // mov dword [rbp+disp32], imm32 (10) + jmp rel32 (5)
                    emit_jz_rel8(buf, 15);
                    emit_st_ctx_imm32(buf, pc_off, target);
                    exit_sites.push(emit_jmp_rel32(buf));
                }
            }
        }

        Opcode::BranchInd => {
            let pc_off = op.cargs()[0];
            match src(ir, op, 0) {
                Src::Reg(r) => emit_st_ctx(buf, Type::I32, r, pc_off),
                Src::Imm(v) => emit_st_ctx_imm32(buf, pc_off, v as u32),
            }
            exit_sites.push(emit_jmp_rel32(buf));
        }

        Opcode::Fallback => {
            let cargs = op.cargs();
            let handler =
                (cargs[0] as u64) | ((cargs[1] as u64) << 32);
            emit_mov_rr(buf, Type::I64, RDI, CTX_REG);
            emit_mov_ri(buf, Type::I32, RSI, cargs[2] as u64);
            emit_mov_ri(buf, Type::I32, RDX, cargs[3] as u64);
            emit_mov_ri(buf, Type::I64, RAX, handler);
            emit_call_rax(buf);
        }

        Opcode::Count => unreachable!(),
    }
}

fn lower_load_guest(
    buf: &mut CodeArena,
    ir: &IrBuilder,
    memif: &MemoryInterface,
    op: &Op,
) {
    let dst = op.regs[0];
    let addr = src(ir, op, 1);
    let size = op.access.size();
    let signed = op.access.is_signed();

    if op.access.is_fastmem() {
        let idx = match addr {
            Src::Reg(r) => r,
            Src::Imm(v) => {
                emit_mov_ri(buf, Type::I32, RAX, v);
                RAX
            }
        };
        emit_fastmem_load(buf, size, signed, dst, idx);
        return;
    }

    // Slow path: call the bus handler.
    let handler = match size {
        MemSize::S8 => memif.r8 as usize,
        MemSize::S16 => memif.r16 as usize,
        _ => memif.r32 as usize,
    };

    emit_mov_ri(buf, Type::I64, RDI, memif.data as u64);
    mov_into(buf, Type::I32, RSI, &addr);
    emit_mov_ri(buf, Type::I64, RAX, handler as u64);
    emit_call_rax(buf);

    if size == MemSize::S64 {
        // Two 32-bit reads: low word first.
        emit_mov_rr(buf, Type::I32, dst, RAX);
        emit_mov_ri(buf, Type::I64, RDI, memif.data as u64);
        mov_into(buf, Type::I32, RSI, &addr);
        emit_add_ri8(buf, RSI, 4);
        emit_mov_ri(buf, Type::I64, RAX, handler as u64);
        emit_call_rax(buf);
        // dst = (hi << 32) | lo
        emit_shift_ri(buf, Type::I64, 4, RAX, 32);
        emit_alu_rr(buf, Type::I64, 0x0B, RAX, dst);
        emit_mov_rr(buf, Type::I64, dst, RAX);
    } else {
        emit_extend_from_eax(buf, size, signed, dst);
    }
}

fn lower_store_guest(
    buf: &mut CodeArena,
    ir: &IrBuilder,
    memif: &MemoryInterface,
    op: &Op,
) {
    let addr = src(ir, op, 0);
    let val = src(ir, op, 1);
    let size = op.access.size();

    if op.access.is_fastmem() {
        let idx = match addr {
            Src::Reg(r) => r,
            Src::Imm(v) => {
                emit_mov_ri(buf, Type::I32, RAX, v);
                RAX
            }
        };
        let s = match val {
            Src::Reg(r) => r,
            Src::Imm(v) => {
                emit_mov_ri(buf, op.ty, RCX, v);
                RCX
            }
        };
        emit_fastmem_store(buf, size, s, idx);
        return;
    }

    let handler = match size {
        MemSize::S8 => memif.w8 as usize,
        MemSize::S16 => memif.w16 as usize,
        _ => memif.w32 as usize,
    };

    emit_mov_ri(buf, Type::I64, RDI, memif.data as u64);
    mov_into(buf, Type::I32, RSI, &addr);
    match (&val, size) {
        (_, MemSize::S64) => {
            // Low word, then high word at addr+4.
            mov_into(buf, Type::I64, RDX, &val);
            emit_mov_ri(buf, Type::I64, RAX, handler as u64);
            emit_call_rax(buf);

            emit_mov_ri(buf, Type::I64, RDI, memif.data as u64);
            mov_into(buf, Type::I32, RSI, &addr);
            emit_add_ri8(buf, RSI, 4);
            mov_into(buf, Type::I64, RDX, &val);
            emit_shift_ri(buf, Type::I64, 5, RDX, 32);
            emit_mov_ri(buf, Type::I64, RAX, handler as u64);
            emit_call_rax(buf);
            return;
        }
        _ => {
            mov_into(buf, Type::I32, RDX, &val);
        }
    }
    emit_mov_ri(buf, Type::I64, RAX, handler as u64);
    emit_call_rax(buf);
}

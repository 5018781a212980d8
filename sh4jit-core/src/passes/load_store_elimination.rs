use std::collections::HashMap;

use crate::op::{Op, OpFlags, Opcode};
use crate::passes::Pass;
use crate::types::Type;
use crate::{IrBuilder, TempIdx};

/// Forwards guest-context values held in temps and deletes context
/// stores that are overwritten before anything can observe them.
///
/// Translators round-trip every guest register through the context, so
/// straight-line blocks are full of load-after-store and
/// store-after-store pairs on the same offset. A block exit (taken
/// conditional included) observes all context state; a fallback call
/// both observes and clobbers it.
pub struct LoadStoreEliminationPass;

impl LoadStoreEliminationPass {
    /// Drop every availability entry overlapping [off, off+size).
    fn clobber(avail: &mut HashMap<u32, (TempIdx, Type)>, off: u32, ty: Type) {
        avail.remove(&off);
        match ty {
            Type::I32 => {
                // A wider value starting 4 bytes below covers us too.
                if let Some(&(_, Type::I64)) = avail.get(&off.wrapping_sub(4)) {
                    avail.remove(&off.wrapping_sub(4));
                }
            }
            Type::I64 => {
                avail.remove(&(off + 4));
                if let Some(&(_, Type::I64)) = avail.get(&off.wrapping_sub(4)) {
                    avail.remove(&off.wrapping_sub(4));
                }
            }
        }
    }
}

impl Pass for LoadStoreEliminationPass {
    fn name(&self) -> &'static str {
        "load_store_elimination"
    }

    fn run(&self, ir: &mut IrBuilder) {
        // offset -> temp currently holding that context slot's value
        let mut avail: HashMap<u32, (TempIdx, Type)> = HashMap::new();
        // offset -> (index, width) of a store not yet observed
        let mut pending: HashMap<u32, (usize, Type)> = HashMap::new();

        let num_ops = ir.num_ops();
        for i in 0..num_ops {
            let op = ir.ops()[i].clone();
            match op.opc {
                Opcode::LoadCtx => {
                    let dst = TempIdx(op.oargs()[0]);
                    let off = op.cargs()[0];
                    // The load observes any pending store at this slot.
                    pending.remove(&off);
                    match avail.get(&off) {
                        Some(&(t, ty)) if ty == op.ty => {
                            ir.ops_mut()[i] =
                                Op::new(Opcode::Mov, ty, &[dst.0, t.0]);
                        }
                        _ => {
                            Self::clobber(&mut avail, off, op.ty);
                            avail.insert(off, (dst, op.ty));
                        }
                    }
                }
                Opcode::StoreCtx => {
                    let src = TempIdx(op.iargs()[0]);
                    let off = op.cargs()[0];
                    // An exact same-width overwrite kills the previous
                    // store; mixed widths only partially overlap and
                    // both survive.
                    match pending.insert(off, (i, op.ty)) {
                        Some((prev, prev_ty)) if prev_ty == op.ty => {
                            ir.ops_mut()[prev] =
                                Op::new(Opcode::Nop, op.ty, &[]);
                        }
                        _ => {}
                    }
                    Self::clobber(&mut avail, off, op.ty);
                    avail.insert(off, (src, op.ty));
                }
                _ => {
                    let flags = op.def().flags;
                    if flags.contains(OpFlags::CALL) {
                        // Fallback: arbitrary context reads and writes.
                        avail.clear();
                        pending.clear();
                    } else if flags.contains(OpFlags::BB_EXIT)
                        || flags.contains(OpFlags::COND_EXIT)
                    {
                        // The dispatcher (or the taken path) sees the
                        // whole context; values stay valid on the
                        // fall-through path.
                        pending.clear();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemSize;

    #[test]
    fn forwards_store_to_load() {
        let mut ir = IrBuilder::new();
        let c = ir.new_const(Type::I32, 42);
        ir.gen_store_ctx(0x10, c);
        let l = ir.gen_load_ctx(Type::I32, 0x10);
        ir.gen_store_ctx(0x14, l);
        ir.gen_branch(0x8c000004, 0);

        LoadStoreEliminationPass.run(&mut ir);

        // The load became a mov from the stored temp.
        let op = &ir.ops()[1];
        assert_eq!(op.opc, Opcode::Mov);
        assert_eq!(op.iargs()[0], c.0);
    }

    #[test]
    fn forwards_load_to_load() {
        let mut ir = IrBuilder::new();
        let a = ir.gen_load_ctx(Type::I32, 0x20);
        let b = ir.gen_load_ctx(Type::I32, 0x20);
        let s = ir.gen_add(a, b);
        ir.gen_store_ctx(0x20, s);
        ir.gen_branch(0x8c000002, 0);

        LoadStoreEliminationPass.run(&mut ir);

        assert_eq!(ir.ops()[0].opc, Opcode::LoadCtx);
        assert_eq!(ir.ops()[1].opc, Opcode::Mov);
        assert_eq!(ir.ops()[1].iargs()[0], a.0);
    }

    #[test]
    fn kills_overwritten_store() {
        let mut ir = IrBuilder::new();
        let a = ir.new_const(Type::I32, 1);
        let b = ir.new_const(Type::I32, 2);
        ir.gen_store_ctx(0x10, a);
        ir.gen_store_ctx(0x10, b);
        ir.gen_branch(0x8c000004, 0);

        LoadStoreEliminationPass.run(&mut ir);

        assert_eq!(ir.ops()[0].opc, Opcode::Nop);
        assert_eq!(ir.ops()[1].opc, Opcode::StoreCtx);
    }

    #[test]
    fn exit_observes_pending_store() {
        let mut ir = IrBuilder::new();
        let a = ir.new_const(Type::I32, 1);
        let b = ir.new_const(Type::I32, 2);
        let cond = ir.gen_load_ctx(Type::I32, 0x40);
        ir.gen_store_ctx(0x10, a);
        ir.gen_branch_cond(cond, 0x8c001000, 0);
        ir.gen_store_ctx(0x10, b);
        ir.gen_branch(0x8c000008, 0);

        LoadStoreEliminationPass.run(&mut ir);

        // The first store is visible on the taken path and survives.
        assert_eq!(ir.ops()[1].opc, Opcode::StoreCtx);
    }

    #[test]
    fn fallback_clobbers_availability() {
        let mut ir = IrBuilder::new();
        let a = ir.gen_load_ctx(Type::I32, 0x10);
        ir.gen_fallback(0x1234, 0x8c000000, 0x0009);
        let b = ir.gen_load_ctx(Type::I32, 0x10);
        let s = ir.gen_add(a, b);
        ir.gen_store_ctx(0x10, s);
        ir.gen_branch(0x8c000004, 0);

        LoadStoreEliminationPass.run(&mut ir);

        // The second load must reload; the fallback may have written
        // the slot.
        assert_eq!(ir.ops()[2].opc, Opcode::LoadCtx);
    }

    #[test]
    fn guest_access_does_not_clobber_context() {
        let mut ir = IrBuilder::new();
        let a = ir.gen_load_ctx(Type::I32, 0x10);
        let _v = ir.gen_load_guest(MemSize::S32, false, true, a);
        let b = ir.gen_load_ctx(Type::I32, 0x10);
        ir.gen_store_ctx(0x14, b);
        ir.gen_branch(0x8c000004, 0);

        LoadStoreEliminationPass.run(&mut ir);

        assert_eq!(ir.ops()[2].opc, Opcode::Mov);
    }
}

use crate::op::{OpFlags, Opcode};
use crate::passes::Pass;
use crate::IrBuilder;

/// Removes ops with no side effects whose outputs are never read.
///
/// Runs a backward liveness scan over the (straight-line) op list,
/// then compacts. Stores, exits and fallback calls are never removed.
pub struct DeadCodeEliminationPass;

impl Pass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn run(&self, ir: &mut IrBuilder) {
        let nb_temps = ir.nb_temps() as usize;
        let mut live = vec![false; nb_temps];

        for i in (0..ir.num_ops()).rev() {
            let op = &ir.ops()[i];
            let flags = op.def().flags;
            let ty = op.ty;

            let output_live = op.oargs().iter().any(|&t| live[t as usize]);

            if !flags.contains(OpFlags::SIDE_EFFECTS) && !output_live {
                ir.ops_mut()[i] = crate::op::Op::new(Opcode::Nop, ty, &[]);
                continue;
            }

            let op = &ir.ops()[i];
            for &t in op.oargs() {
                live[t as usize] = false;
            }
            for &t in op.iargs() {
                live[t as usize] = true;
            }
        }

        ir.ops_mut().retain(|op| op.opc != Opcode::Nop);
    }
}

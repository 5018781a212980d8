use std::collections::{HashMap, VecDeque};

use crate::op::{Op, Opcode};
use crate::passes::Pass;
use crate::types::Register;
use crate::{IrBuilder, TempIdx};

/// Linear-scan register allocation over the straight-line op list,
/// parameterized by the backend's register file.
///
/// Each temp argument gets the host register carrying it at that op
/// written into `Op::regs`. Under pressure the temp whose next use is
/// furthest away is spilled to a numbered stack slot; `LoadSlot` /
/// `StoreSlot` ops are inserted around the uses. `IrBuilder::num_slots`
/// reports how many slots the backend frame must reserve.
pub struct RegisterAllocationPass {
    registers: &'static [Register],
}

impl RegisterAllocationPass {
    pub fn new(registers: &'static [Register]) -> Self {
        assert!(!registers.is_empty(), "empty register file");
        Self { registers }
    }
}

struct AllocState {
    /// reg code -> temp currently held
    reg_temp: HashMap<u8, TempIdx>,
    temp_reg: HashMap<TempIdx, u8>,
    free: Vec<u8>,
    slot_of: HashMap<TempIdx, u16>,
    next_slot: u16,
    /// Remaining use positions (original op indices) per temp.
    uses: Vec<VecDeque<usize>>,
    out: Vec<Op>,
}

impl AllocState {
    fn next_use(&self, t: TempIdx) -> usize {
        self.uses[t.0 as usize]
            .front()
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Take a free register, spilling the furthest-used occupant if
    /// none is free. Never touches a pinned register.
    fn alloc_reg(&mut self, ir: &IrBuilder, pinned: &[u8]) -> u8 {
        if let Some(r) = self.free.pop() {
            return r;
        }

        let victim_reg = self
            .reg_temp
            .iter()
            .filter(|(r, _)| !pinned.contains(r))
            .max_by_key(|(_, &t)| self.next_use(t))
            .map(|(&r, _)| r)
            .expect("all registers pinned by one op");
        let victim = self.reg_temp[&victim_reg];

        if self.next_use(victim) != usize::MAX {
            let slot = *self.slot_of.entry(victim).or_insert_with(|| {
                let s = self.next_slot;
                self.next_slot += 1;
                s
            });
            let ty = ir.temp(victim).ty;
            let mut spill =
                Op::new(Opcode::StoreSlot, ty, &[victim.0, slot as u32]);
            spill.regs[0] = victim_reg;
            self.out.push(spill);
        }

        self.reg_temp.remove(&victim_reg);
        self.temp_reg.remove(&victim);
        victim_reg
    }

    /// Make sure `t` is in a register, reloading from its spill slot
    /// if necessary.
    fn ensure_reg(&mut self, ir: &IrBuilder, t: TempIdx, pinned: &[u8]) -> u8 {
        if let Some(&r) = self.temp_reg.get(&t) {
            return r;
        }
        let r = self.alloc_reg(ir, pinned);
        let slot = *self
            .slot_of
            .get(&t)
            .expect("use of temp that was never defined");
        let ty = ir.temp(t).ty;
        let mut reload = Op::new(Opcode::LoadSlot, ty, &[t.0, slot as u32]);
        reload.regs[0] = r;
        self.out.push(reload);
        self.assign(r, t);
        r
    }

    fn assign(&mut self, r: u8, t: TempIdx) {
        self.reg_temp.insert(r, t);
        self.temp_reg.insert(t, r);
    }

    fn release(&mut self, t: TempIdx) {
        if let Some(r) = self.temp_reg.remove(&t) {
            self.reg_temp.remove(&r);
            self.free.push(r);
        }
    }
}

impl Pass for RegisterAllocationPass {
    fn name(&self) -> &'static str {
        "register_allocation"
    }

    fn run(&self, ir: &mut IrBuilder) {
        let nb_temps = ir.nb_temps() as usize;
        let mut uses = vec![VecDeque::new(); nb_temps];
        for (i, op) in ir.ops().iter().enumerate() {
            for &t in op.iargs() {
                if !ir.temp(TempIdx(t)).is_const {
                    uses[t as usize].push_back(i);
                }
            }
        }

        let mut st = AllocState {
            reg_temp: HashMap::new(),
            temp_reg: HashMap::new(),
            free: self.registers.iter().rev().map(|r| r.code).collect(),
            slot_of: HashMap::new(),
            next_slot: 0,
            uses,
            out: Vec::with_capacity(ir.num_ops()),
        };

        let num_ops = ir.num_ops();
        for i in 0..num_ops {
            let mut op = ir.ops()[i].clone();
            if op.opc == Opcode::Nop {
                continue;
            }

            let nb_oargs = op.def().nb_oargs as usize;
            let nb_iargs = op.def().nb_iargs as usize;
            let mut pinned: Vec<u8> = Vec::with_capacity(nb_iargs);

            // Inputs first: every non-const input temp gets a register.
            for k in 0..nb_iargs {
                let t = TempIdx(op.args[nb_oargs + k]);
                if ir.temp(t).is_const {
                    continue;
                }
                let r = st.ensure_reg(ir, t, &pinned);
                pinned.push(r);
                op.regs[nb_oargs + k] = r;
            }

            // Consume this op's use positions and retire dead temps.
            for k in 0..nb_iargs {
                let t = TempIdx(op.args[nb_oargs + k]);
                if ir.temp(t).is_const {
                    continue;
                }
                let q = &mut st.uses[t.0 as usize];
                while q.front() == Some(&i) {
                    q.pop_front();
                }
            }
            for k in 0..nb_iargs {
                let t = TempIdx(op.args[nb_oargs + k]);
                if !ir.temp(t).is_const && st.next_use(t) == usize::MAX {
                    st.release(t);
                }
            }

            // Outputs: fresh definitions.
            for k in 0..nb_oargs {
                let t = TempIdx(op.args[k]);
                assert!(
                    !st.temp_reg.contains_key(&t),
                    "temp {} defined twice",
                    t.0
                );
                let r = st.alloc_reg(ir, &pinned);
                st.assign(r, t);
                op.regs[k] = r;
            }

            let oarg_temps = op.args;
            st.out.push(op);

            // A definition nothing reads can release its register
            // immediately.
            for &arg in oarg_temps.iter().take(nb_oargs) {
                let t = TempIdx(arg);
                if st.next_use(t) == usize::MAX {
                    st.release(t);
                }
            }
        }

        ir.num_slots = st.next_slot;
        *ir.ops_mut() = st.out;
    }
}

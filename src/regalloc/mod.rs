//! Register allocation for EIR.
//!
//! Variables live across a call go to the stack, since every allocatable
//! register is caller-saved. The rest are assigned by linear scan over
//! interval hulls. Program points are numbered per instruction: uses at
//! `2i`, definitions at `2i + 1`, so a value may reuse the register of an
//! operand that dies at the same instruction.

pub mod linear_scan;
pub mod liveness;

pub use linear_scan::Interval;
pub use liveness::{LiveSet, Liveness, StopKey};

use crate::asm::Reg;
use crate::ir::eir::{EirMethod, VarId};
use crate::target::RegisterConfig;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(Reg),
    /// Spill slot index; slot `i` is at `[sp, #8 * i]`.
    Stack(u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Register(r) => write!(f, "x{}", r.code()),
            Location::Stack(slot) => write!(f, "[sp, #{}]", slot * 8),
        }
    }
}

/// Result of register allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    locations: HashMap<VarId, Location>,
    pub frame_slots: u32,
    pub stop_live: HashMap<StopKey, LiveSet>,
}

impl Allocation {
    /// Location of `var`. Variables that no instruction mentions read as
    /// the zero register.
    pub fn location(&self, var: VarId) -> Location {
        self.locations.get(&var).copied().unwrap_or(Location::Register(Reg::XZR))
    }

    pub fn live_at(&self, stop: StopKey) -> impl Iterator<Item = VarId> + '_ {
        self.stop_live.get(&stop).into_iter().flat_map(|s| s.iter().copied())
    }
}

/// Hull intervals over the linear block order.
pub fn build_intervals(method: &EirMethod, liveness: &Liveness) -> BTreeMap<VarId, Interval> {
    let mut intervals: BTreeMap<VarId, Interval> = BTreeMap::new();
    let mut touch = |var: VarId, point: u32| {
        intervals
            .entry(var)
            .or_insert(Interval { var, start: point, end: point })
            .cover(point);
    };
    let mut base = 0u32;
    for (block, b) in method.blocks.iter() {
        let start = base;
        for (i, insn) in b.insns.iter().enumerate() {
            let at = base + 2 * i as u32;
            for used in insn.uses() {
                touch(used, at);
            }
            if let Some(def) = insn.def() {
                touch(def, at + 1);
            }
        }
        let term_at = base + 2 * b.insns.len() as u32;
        for used in b.term.uses() {
            touch(used, term_at);
        }
        let end = term_at + 1;
        for &var in &liveness.live_in[block.index()] {
            touch(var, start);
        }
        for &var in &liveness.live_out[block.index()] {
            touch(var, end);
        }
        base = end + 1;
    }
    intervals
}

/// Allocate every variable of `method`.
pub fn allocate(method: &EirMethod, registers: &RegisterConfig) -> Allocation {
    let liveness = Liveness::compute(method);
    let intervals = build_intervals(method, &liveness);
    let across = liveness.live_across_calls(method);

    let (mut on_stack, candidates): (Vec<Interval>, Vec<Interval>) =
        intervals.values().copied().partition(|i| across.contains(&i.var));
    let (assigned, spilled) = linear_scan::scan_registers(candidates, &registers.allocatable);
    on_stack.extend(spilled);
    let spills = on_stack.len();
    let (slots, frame_slots) = linear_scan::scan_stack(on_stack);

    let mut locations: HashMap<VarId, Location> = slots.into_iter().collect();
    locations.extend(assigned.into_iter().map(|(v, r)| (v, Location::Register(r))));
    debug!(
        method = %method.key,
        vars = method.vars.len(),
        stack_vars = spills,
        frame_slots,
        "allocated registers"
    );
    Allocation { locations, frame_slots, stop_live: liveness.stop_live }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::bytecode::{MethodKey, Signature};
    use crate::ir::cir::BinaryOp;
    use crate::ir::eir::{CallTarget, EirInsn, Terminator};
    use crate::ir::kind::{Kind, Value};

    fn method() -> EirMethod {
        EirMethod::new(MethodKey::new("T", "m", "()I"), Signature { params: vec![], ret: Kind::Int })
    }

    #[test]
    fn test_call_crossing_values_are_spilled() {
        let mut m = method();
        let b = m.add_block();
        let (a, r, s) = (m.new_var(Kind::Reference), m.new_var(Kind::Int), m.new_var(Kind::Int));
        let t = m.new_var(Kind::Int);
        m.blocks[b].insns = vec![
            EirInsn::Const { dst: a, value: Value::Null },
            EirInsn::Call {
                target: CallTarget::Direct(MethodKey::new("T", "f", "()I")),
                args: vec![],
                result: Some(r),
                noreturn: false,
                bci: 0,
            },
            EirInsn::Const { dst: t, value: Value::Int(3) },
            EirInsn::Arith { op: BinaryOp::Add, kind: Kind::Int, dst: s, lhs: r, rhs: t },
            EirInsn::Call {
                target: CallTarget::Direct(MethodKey::new("T", "g", "(Ljava/lang/Object;)V")),
                args: vec![a],
                result: None,
                noreturn: false,
                bci: 1,
            },
        ];
        m.blocks[b].term = Terminator::Return(Some(s));
        let alloc = allocate(&m, &RegisterConfig::aarch64());
        assert_eq!(alloc.location(a), Location::Stack(0));
        assert_eq!(alloc.location(s), Location::Stack(1));
        assert!(matches!(alloc.location(r), Location::Register(_)));
        assert!(matches!(alloc.location(t), Location::Register(_)));
        assert_eq!(alloc.frame_slots, 2);
    }

    #[test]
    fn test_pressure_spills_without_overlap() {
        let mut m = method();
        let b = m.add_block();
        let vars: Vec<VarId> = (0..10).map(|_| m.new_var(Kind::Long)).collect();
        let mut insns: Vec<EirInsn> = vars
            .iter()
            .enumerate()
            .map(|(i, &v)| EirInsn::Const { dst: v, value: Value::Long(i as i64) })
            .collect();
        let sum = m.new_var(Kind::Long);
        insns.push(EirInsn::Move { dst: sum, src: vars[0] });
        for &v in &vars[1..] {
            insns.push(EirInsn::Arith { op: BinaryOp::Add, kind: Kind::Long, dst: sum, lhs: sum, rhs: v });
        }
        m.blocks[b].insns = insns;
        m.blocks[b].term = Terminator::Return(Some(sum));
        let alloc = allocate(&m, &RegisterConfig::aarch64());
        let stacked = vars.iter().filter(|&&v| matches!(alloc.location(v), Location::Stack(_))).count();
        assert!(stacked >= 3);
        let liveness = Liveness::compute(&m);
        let intervals = build_intervals(&m, &liveness);
        let all: Vec<&Interval> = intervals.values().collect();
        for (i, x) in all.iter().enumerate() {
            for y in &all[i + 1..] {
                let overlap = x.start <= y.end && y.start <= x.end;
                if overlap {
                    assert_ne!(alloc.location(x.var), alloc.location(y.var), "{x:?} and {y:?} share a location");
                }
            }
        }
    }
}

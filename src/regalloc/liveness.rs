//! Backward liveness over EIR blocks.
//!
//! A block covered by a handler has the handler as an extra successor, and
//! the handler's live-in set is live at every call inside the block.

use crate::ir::eir::{EirBlockId, EirInsn, EirMethod, VarId};
use std::collections::{BTreeSet, HashMap};

pub type LiveSet = BTreeSet<VarId>;

/// A stop is identified by its block and instruction index.
pub type StopKey = (EirBlockId, usize);

#[derive(Debug, Clone, Default)]
pub struct Liveness {
    pub live_in: Vec<LiveSet>,
    pub live_out: Vec<LiveSet>,
    /// Exact set of variables live across each call and at each safepoint.
    pub stop_live: HashMap<StopKey, LiveSet>,
}

fn successors(method: &EirMethod, block: EirBlockId) -> Vec<EirBlockId> {
    let b = &method.blocks[block];
    let mut succs = b.term.successors();
    if let Some(h) = b.handler {
        succs.push(h);
    }
    succs
}

impl Liveness {
    pub fn compute(method: &EirMethod) -> Self {
        let n = method.blocks.len();
        let mut live = Liveness {
            live_in: vec![LiveSet::new(); n],
            live_out: vec![LiveSet::new(); n],
            stop_live: HashMap::new(),
        };
        let blocks: Vec<EirBlockId> = method.blocks.ids().collect();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in blocks.iter().rev() {
                let mut out = LiveSet::new();
                for succ in successors(method, block) {
                    out.extend(live.live_in[succ.index()].iter().copied());
                }
                let live_in = live.transfer(method, block, &out, false);
                if out != live.live_out[block.index()] || live_in != live.live_in[block.index()] {
                    live.live_out[block.index()] = out;
                    live.live_in[block.index()] = live_in;
                    changed = true;
                }
            }
        }
        for &block in &blocks {
            let out = live.live_out[block.index()].clone();
            live.transfer(method, block, &out, true);
        }
        live
    }

    /// Walk `block` backwards from `out`, returning its live-in set. Records
    /// stop liveness when `record` is set.
    fn transfer(&mut self, method: &EirMethod, block: EirBlockId, out: &LiveSet, record: bool) -> LiveSet {
        let b = &method.blocks[block];
        let handler_in = b.handler.map(|h| self.live_in[h.index()].clone()).unwrap_or_default();
        let mut live = out.clone();
        live.extend(b.term.uses());
        for (index, insn) in b.insns.iter().enumerate().rev() {
            if let Some(def) = insn.def() {
                live.remove(&def);
            }
            match insn {
                EirInsn::Call { .. } => {
                    live.extend(handler_in.iter().copied());
                    if record {
                        self.stop_live.insert((block, index), live.clone());
                    }
                }
                EirInsn::Safepoint { .. } if record => {
                    self.stop_live.insert((block, index), live.clone());
                }
                _ => {}
            }
            live.extend(insn.uses());
        }
        live
    }

    /// Variables that must survive a call and therefore live on the stack.
    pub fn live_across_calls(&self, method: &EirMethod) -> BTreeSet<VarId> {
        let mut across = BTreeSet::new();
        for (&(block, index), set) in &self.stop_live {
            if method.blocks[block].insns[index].is_call() {
                across.extend(set.iter().copied());
            }
        }
        across
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::bytecode::{MethodKey, Signature};
    use crate::ir::eir::{CallTarget, Terminator};
    use crate::ir::kind::{Kind, Value};

    fn empty() -> EirMethod {
        EirMethod::new(MethodKey::new("T", "m", "()I"), Signature { params: vec![], ret: Kind::Int })
    }

    #[test]
    fn test_value_live_across_call() {
        let mut m = empty();
        let b = m.add_block();
        let (a, r, s) = (m.new_var(Kind::Int), m.new_var(Kind::Int), m.new_var(Kind::Int));
        m.blocks[b].insns = vec![
            EirInsn::Const { dst: a, value: Value::Int(1) },
            EirInsn::Call {
                target: CallTarget::Direct(MethodKey::new("T", "f", "()I")),
                args: vec![],
                result: Some(r),
                noreturn: false,
                bci: 0,
            },
            EirInsn::Arith { op: crate::ir::cir::BinaryOp::Add, kind: Kind::Int, dst: s, lhs: a, rhs: r },
        ];
        m.blocks[b].term = Terminator::Return(Some(s));
        let live = Liveness::compute(&m);
        assert_eq!(live.stop_live[&(b, 1)], LiveSet::from([a]));
        assert_eq!(live.live_across_calls(&m), BTreeSet::from([a]));
        assert!(live.live_in[b.index()].is_empty());
    }

    #[test]
    fn test_loop_keeps_value_live() {
        let mut m = empty();
        let (entry, body, exit) = (m.add_block(), m.add_block(), m.add_block());
        let (i, one) = (m.new_var(Kind::Int), m.new_var(Kind::Int));
        m.blocks[entry].insns = vec![
            EirInsn::Const { dst: i, value: Value::Int(0) },
            EirInsn::Const { dst: one, value: Value::Int(1) },
        ];
        m.blocks[entry].term = Terminator::Jump(body);
        m.blocks[body].insns = vec![
            EirInsn::Arith { op: crate::ir::cir::BinaryOp::Add, kind: Kind::Int, dst: i, lhs: i, rhs: one },
            EirInsn::Safepoint { bci: 4 },
        ];
        m.blocks[body].term = Terminator::Branch {
            cond: crate::ir::bytecode::Comparison::Lt,
            kind: Kind::Int,
            lhs: i,
            rhs: one,
            taken: body,
            not_taken: exit,
        };
        m.blocks[exit].term = Terminator::Return(Some(i));
        let live = Liveness::compute(&m);
        assert_eq!(live.live_in[body.index()], LiveSet::from([i, one]));
        assert_eq!(live.stop_live[&(body, 1)], LiveSet::from([i, one]));
    }

    #[test]
    fn test_handler_live_in_at_protected_call() {
        let mut m = empty();
        let (entry, handler) = (m.add_block(), m.add_block());
        let (x, e) = (m.new_var(Kind::Reference), m.new_var(Kind::Reference));
        m.blocks[entry].insns = vec![
            EirInsn::Const { dst: x, value: Value::Null },
            EirInsn::Call {
                target: CallTarget::Direct(MethodKey::new("T", "f", "()V")),
                args: vec![],
                result: None,
                noreturn: false,
                bci: 1,
            },
        ];
        m.blocks[entry].handler = Some(handler);
        m.blocks[entry].term = Terminator::Return(None);
        m.blocks[handler].is_catch = true;
        m.blocks[handler].insns = vec![EirInsn::CatchParameter { dst: e }];
        m.blocks[handler].term = Terminator::Return(Some(x));
        let live = Liveness::compute(&m);
        assert!(live.stop_live[&(entry, 1)].contains(&x));
    }
}

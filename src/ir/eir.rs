//! EIR: the near-machine representation.
//!
//! Values live in explicit variables that the register allocator maps to
//! registers or stack slots. Control flow is a list of blocks in emission
//! order; merges are ordinary moves. Each block records the exception
//! handler that covers its calls.

use super::arena::{Arena, Id};
use super::bytecode::{Comparison, MethodKey, Signature};
use super::cir::{BinaryOp, Conversion};
use super::kind::{Kind, ObjectRef, Value};
use std::collections::HashMap;
use std::fmt::Write as _;

pub type VarId = Id<EirVar>;
pub type EirBlockId = Id<EirBlock>;
pub type LiteralId = Id<Literal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EirVar {
    pub kind: Kind,
}

/// A constant stored next to the code instead of in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Scalar(Value),
    Reference(ObjectRef),
}

impl Literal {
    /// Bytes occupied in the scalar literal area.
    pub fn scalar_width(&self) -> Option<usize> {
        match self {
            Literal::Scalar(v) => Some(v.kind().width()),
            Literal::Reference(_) => None,
        }
    }
}

/// Whether `bits` can be materialised with a single `movz` or `movn`.
pub fn fits_move_immediate(bits: i64) -> bool {
    (0..=0xFFFF).contains(&bits) || (-0x10000..0).contains(&bits)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Direct(MethodKey),
    /// A native function, linked like a direct call but flagged in the stop.
    Native(MethodKey),
    Indirect(VarId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EirInsn {
    Move { dst: VarId, src: VarId },
    /// A value that fits a move immediate.
    Const { dst: VarId, value: Value },
    LoadLiteral { dst: VarId, literal: LiteralId },
    /// Incoming argument register `index`.
    Parameter { dst: VarId, index: u16 },
    Arith { op: BinaryOp, kind: Kind, dst: VarId, lhs: VarId, rhs: VarId },
    Negate { kind: Kind, dst: VarId, src: VarId },
    Convert { conversion: Conversion, dst: VarId, src: VarId },
    Call { target: CallTarget, args: Vec<VarId>, result: Option<VarId>, noreturn: bool, bci: usize },
    Safepoint { bci: usize },
    /// The exception delivered to a handler.
    CatchParameter { dst: VarId },
}

impl EirInsn {
    pub fn uses(&self) -> Vec<VarId> {
        match self {
            EirInsn::Move { src, .. } => vec![*src],
            EirInsn::Const { .. }
            | EirInsn::LoadLiteral { .. }
            | EirInsn::Parameter { .. }
            | EirInsn::Safepoint { .. }
            | EirInsn::CatchParameter { .. } => vec![],
            EirInsn::Arith { lhs, rhs, .. } => vec![*lhs, *rhs],
            EirInsn::Negate { src, .. } | EirInsn::Convert { src, .. } => vec![*src],
            EirInsn::Call { target, args, .. } => {
                let mut uses = args.clone();
                if let CallTarget::Indirect(t) = target {
                    uses.push(*t);
                }
                uses
            }
        }
    }

    pub fn def(&self) -> Option<VarId> {
        match self {
            EirInsn::Move { dst, .. }
            | EirInsn::Const { dst, .. }
            | EirInsn::LoadLiteral { dst, .. }
            | EirInsn::Parameter { dst, .. }
            | EirInsn::Arith { dst, .. }
            | EirInsn::Negate { dst, .. }
            | EirInsn::Convert { dst, .. }
            | EirInsn::CatchParameter { dst } => Some(*dst),
            EirInsn::Call { result, .. } => *result,
            EirInsn::Safepoint { .. } => None,
        }
    }

    /// Calls and safepoints need a reference map.
    pub fn is_stop(&self) -> bool {
        matches!(self, EirInsn::Call { .. } | EirInsn::Safepoint { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, EirInsn::Call { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(EirBlockId),
    Branch {
        cond: Comparison,
        kind: Kind,
        lhs: VarId,
        rhs: VarId,
        taken: EirBlockId,
        not_taken: EirBlockId,
    },
    Return(Option<VarId>),
    /// Control never gets here (after a call that does not return).
    Unreachable,
}

impl Terminator {
    pub fn uses(&self) -> Vec<VarId> {
        match self {
            Terminator::Branch { lhs, rhs, .. } => vec![*lhs, *rhs],
            Terminator::Return(Some(v)) => vec![*v],
            Terminator::Jump(_) | Terminator::Return(None) | Terminator::Unreachable => vec![],
        }
    }

    pub fn successors(&self) -> Vec<EirBlockId> {
        match self {
            Terminator::Jump(t) => vec![*t],
            Terminator::Branch { taken, not_taken, .. } => vec![*taken, *not_taken],
            Terminator::Return(_) | Terminator::Unreachable => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EirBlock {
    pub insns: Vec<EirInsn>,
    pub term: Terminator,
    /// Handler entered when a call in this block throws.
    pub handler: Option<EirBlockId>,
    /// First block of an exception handler.
    pub is_catch: bool,
}

/// One method in EIR form. Blocks are emitted in arena order.
#[derive(Debug, Clone)]
pub struct EirMethod {
    pub key: MethodKey,
    pub signature: Signature,
    pub vars: Arena<EirVar>,
    pub blocks: Arena<EirBlock>,
    pub literals: Arena<Literal>,
    literal_index: HashMap<Value, LiteralId>,
}

impl EirMethod {
    pub fn new(key: MethodKey, signature: Signature) -> Self {
        Self {
            key,
            signature,
            vars: Arena::new(),
            blocks: Arena::new(),
            literals: Arena::new(),
            literal_index: HashMap::new(),
        }
    }

    pub fn new_var(&mut self, kind: Kind) -> VarId {
        self.vars.alloc(EirVar { kind })
    }

    pub fn add_block(&mut self) -> EirBlockId {
        self.blocks.alloc(EirBlock {
            insns: Vec::new(),
            term: Terminator::Unreachable,
            handler: None,
            is_catch: false,
        })
    }

    /// Intern a literal. Equal values share one pool entry.
    pub fn literal(&mut self, value: Value) -> LiteralId {
        if let Some(&id) = self.literal_index.get(&value) {
            return id;
        }
        let literal = match value {
            Value::Reference(r) => Literal::Reference(r),
            other => Literal::Scalar(other),
        };
        let id = self.literals.alloc(literal);
        self.literal_index.insert(value, id);
        id
    }

    pub fn entry(&self) -> EirBlockId {
        Id::new(0)
    }

    /// Whether any block is covered by an exception handler.
    pub fn has_handlers(&self) -> bool {
        self.blocks.iter().any(|(_, b)| b.handler.is_some())
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "eir {}", self.key);
        for (id, lit) in self.literals.iter() {
            let _ = writeln!(out, "  lit{}: {lit:?}", id.index());
        }
        for (id, block) in self.blocks.iter() {
            let mut header = format!("e{}", id.index());
            if block.is_catch {
                header.push_str(" catch");
            }
            if let Some(h) = block.handler {
                let _ = write!(header, " handler e{}", h.index());
            }
            let _ = writeln!(out, "{header}:");
            for insn in &block.insns {
                let _ = writeln!(out, "  {insn:?}");
            }
            let _ = writeln!(out, "  {:?}", block.term);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_immediate_range() {
        assert!(fits_move_immediate(0));
        assert!(fits_move_immediate(0xFFFF));
        assert!(!fits_move_immediate(0x10000));
        assert!(fits_move_immediate(-1));
        assert!(fits_move_immediate(-0x10000));
        assert!(!fits_move_immediate(-0x10001));
    }

    #[test]
    fn test_literals_are_interned() {
        let mut m = EirMethod::new(
            MethodKey::new("T", "m", "()V"),
            Signature { params: vec![], ret: Kind::Void },
        );
        let a = m.literal(Value::Long(1 << 40));
        let b = m.literal(Value::Long(1 << 40));
        let c = m.literal(Value::Reference(ObjectRef(7)));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m.literals[a].scalar_width(), Some(8));
        assert_eq!(m.literals[c].scalar_width(), None);
    }

    #[test]
    fn test_call_uses_include_indirect_target() {
        let mut m = EirMethod::new(
            MethodKey::new("T", "m", "()V"),
            Signature { params: vec![], ret: Kind::Void },
        );
        let t = m.new_var(Kind::Word);
        let a = m.new_var(Kind::Int);
        let r = m.new_var(Kind::Int);
        let call = EirInsn::Call {
            target: CallTarget::Indirect(t),
            args: vec![a],
            result: Some(r),
            noreturn: false,
            bci: 3,
        };
        assert_eq!(call.uses(), vec![a, t]);
        assert_eq!(call.def(), Some(r));
        assert!(call.is_stop());
    }
}

//! CIR: the continuation-style intermediate representation.
//!
//! A method is a set of blocks. Each block owns parameter nodes (the values
//! passed by its predecessors), a body in evaluation order and exactly one
//! continuation. Every edge passes one argument per parameter of its target,
//! so there are no phis: merges are parameter passing.
//!
//! Operators fall into four closed categories, dispatched by `match`.

use super::arena::{Arena, Id};
use super::bytecode::{Comparison, MethodKey, Signature};
use super::kind::{Kind, ObjectRef, Value};
use std::collections::HashSet;
use std::fmt::Write as _;

pub type NodeId = Id<CirNode>;
pub type BlockId = Id<CirBlock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversion {
    IntToLong,
    LongToInt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArithmeticOp {
    Constant(Value),
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
    Negate(NodeId),
    Convert { conversion: Conversion, operand: NodeId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlOp {
    /// Incoming method parameter `n`.
    Parameter(u16),
    /// Parameter `index` of `block`.
    BlockParam { block: BlockId, index: u16 },
    /// Safepoint poll.
    Safepoint,
    /// The exception delivered to a handler block.
    CatchParameter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOp {
    NewArray { element: Kind, length: NodeId },
    NewInstance { class: ObjectRef },
    ArrayLength { array: NodeId },
    ArrayLoad { element: Kind, array: NodeId, index: NodeId },
    ArrayStore { element: Kind, array: NodeId, index: NodeId, value: NodeId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOp {
    Static { method: MethodKey, args: Vec<NodeId> },
    Native { method: MethodKey, args: Vec<NodeId> },
    Indirect { target: NodeId, signature: Signature, args: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Arithmetic(ArithmeticOp),
    Control(ControlOp),
    Allocation(AllocationOp),
    Invoke(InvokeOp),
}

impl Operator {
    pub fn constant(value: Value) -> Self {
        Operator::Arithmetic(ArithmeticOp::Constant(value))
    }

    pub fn as_constant(&self) -> Option<Value> {
        match self {
            Operator::Arithmetic(ArithmeticOp::Constant(v)) => Some(*v),
            _ => None,
        }
    }

    /// Nodes read by this operator.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Operator::Arithmetic(op) => match op {
                ArithmeticOp::Constant(_) => vec![],
                ArithmeticOp::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
                ArithmeticOp::Negate(x) => vec![*x],
                ArithmeticOp::Convert { operand, .. } => vec![*operand],
            },
            Operator::Control(_) => vec![],
            Operator::Allocation(op) => match op {
                AllocationOp::NewArray { length, .. } => vec![*length],
                AllocationOp::NewInstance { .. } => vec![],
                AllocationOp::ArrayLength { array } => vec![*array],
                AllocationOp::ArrayLoad { array, index, .. } => vec![*array, *index],
                AllocationOp::ArrayStore { array, index, value, .. } => vec![*array, *index, *value],
            },
            Operator::Invoke(op) => match op {
                InvokeOp::Static { args, .. } | InvokeOp::Native { args, .. } => args.clone(),
                InvokeOp::Indirect { target, args, .. } => {
                    let mut inputs = vec![*target];
                    inputs.extend(args);
                    inputs
                }
            },
        }
    }

    fn inputs_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            Operator::Arithmetic(op) => match op {
                ArithmeticOp::Constant(_) => vec![],
                ArithmeticOp::Binary { lhs, rhs, .. } => vec![lhs, rhs],
                ArithmeticOp::Negate(x) => vec![x],
                ArithmeticOp::Convert { operand, .. } => vec![operand],
            },
            Operator::Control(_) => vec![],
            Operator::Allocation(op) => match op {
                AllocationOp::NewArray { length, .. } => vec![length],
                AllocationOp::NewInstance { .. } => vec![],
                AllocationOp::ArrayLength { array } => vec![array],
                AllocationOp::ArrayLoad { array, index, .. } => vec![array, index],
                AllocationOp::ArrayStore { array, index, value, .. } => vec![array, index, value],
            },
            Operator::Invoke(op) => match op {
                InvokeOp::Static { args, .. } | InvokeOp::Native { args, .. } => args.iter_mut().collect(),
                InvokeOp::Indirect { target, args, .. } => {
                    let mut inputs = vec![target];
                    inputs.extend(args.iter_mut());
                    inputs
                }
            },
        }
    }

    /// Whether evaluating this operator can raise an exception.
    pub fn can_throw(&self) -> bool {
        matches!(self, Operator::Allocation(_) | Operator::Invoke(_))
    }

    /// Whether the node may be dropped when its value is unused.
    pub fn is_pure(&self) -> bool {
        matches!(self, Operator::Arithmetic(_))
    }
}

/// A value-producing (or effect) node.
#[derive(Debug, Clone, PartialEq)]
pub struct CirNode {
    pub op: Operator,
    pub kind: Kind,
    /// Bytecode position this node came from.
    pub bci: usize,
    /// Exceptional continuation for nodes inside a protected range.
    pub catch: Option<Edge>,
}

/// A transfer of control passing one argument per target parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub target: BlockId,
    pub args: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    Jump(Edge),
    Branch { cond: Comparison, lhs: NodeId, rhs: NodeId, taken: Edge, not_taken: Edge },
    Return(Option<NodeId>),
    Throw { exception: NodeId, catch: Option<Edge> },
}

impl Continuation {
    pub fn edges(&self) -> Vec<&Edge> {
        match self {
            Continuation::Jump(e) => vec![e],
            Continuation::Branch { taken, not_taken, .. } => vec![taken, not_taken],
            Continuation::Return(_) => vec![],
            Continuation::Throw { catch, .. } => catch.iter().collect(),
        }
    }

    fn edges_mut(&mut self) -> Vec<&mut Edge> {
        match self {
            Continuation::Jump(e) => vec![e],
            Continuation::Branch { taken, not_taken, .. } => vec![taken, not_taken],
            Continuation::Return(_) => vec![],
            Continuation::Throw { catch, .. } => catch.iter_mut().collect(),
        }
    }

    /// Nodes read directly by the continuation, not counting edge arguments.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Continuation::Jump(_) => vec![],
            Continuation::Branch { lhs, rhs, .. } => vec![*lhs, *rhs],
            Continuation::Return(v) => v.iter().copied().collect(),
            Continuation::Throw { exception, .. } => vec![*exception],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CirBlock {
    pub params: Vec<NodeId>,
    pub body: Vec<NodeId>,
    pub cont: Continuation,
    /// Bytecode position of the block start.
    pub bci: usize,
    /// Entered only through exception edges.
    pub is_handler: bool,
}

/// One method in CIR form.
#[derive(Debug, Clone)]
pub struct CirGraph {
    pub key: MethodKey,
    pub signature: Signature,
    pub nodes: Arena<CirNode>,
    pub blocks: Arena<CirBlock>,
    pub entry: BlockId,
}

impl CirGraph {
    pub fn new(key: MethodKey, signature: Signature) -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(CirBlock {
            params: Vec::new(),
            body: Vec::new(),
            cont: Continuation::Return(None),
            bci: 0,
            is_handler: false,
        });
        Self { key, signature, nodes: Arena::new(), blocks, entry }
    }

    pub fn add_node(&mut self, op: Operator, kind: Kind, bci: usize) -> NodeId {
        self.nodes.alloc(CirNode { op, kind, bci, catch: None })
    }

    pub fn add_block(&mut self, bci: usize, is_handler: bool) -> BlockId {
        self.blocks.alloc(CirBlock {
            params: Vec::new(),
            body: Vec::new(),
            cont: Continuation::Return(None),
            bci,
            is_handler,
        })
    }

    /// Append a parameter of `kind` to `block`.
    pub fn add_param(&mut self, block: BlockId, kind: Kind) -> NodeId {
        let index = self.blocks[block].params.len() as u16;
        let bci = self.blocks[block].bci;
        let id = self.add_node(Operator::Control(ControlOp::BlockParam { block, index }), kind, bci);
        self.blocks[block].params.push(id);
        id
    }

    /// Replace the operator held at `id`. Users keep pointing at `id`.
    pub fn replace(&mut self, id: NodeId, op: Operator) {
        self.nodes[id].op = op;
        if !self.nodes[id].op.can_throw() {
            self.nodes[id].catch = None;
        }
    }

    /// Make every use of `from` read `to` instead.
    pub fn redirect(&mut self, from: NodeId, to: NodeId) {
        let swap = |slot: &mut NodeId| {
            if *slot == from {
                *slot = to;
            }
        };
        for id in self.nodes.ids().collect::<Vec<_>>() {
            let node = &mut self.nodes[id];
            for input in node.op.inputs_mut() {
                swap(input);
            }
            if let Some(edge) = &mut node.catch {
                edge.args.iter_mut().for_each(swap);
            }
        }
        for id in self.blocks.ids().collect::<Vec<_>>() {
            let cont = &mut self.blocks[id].cont;
            match cont {
                Continuation::Branch { lhs, rhs, .. } => {
                    swap(lhs);
                    swap(rhs);
                }
                Continuation::Return(Some(v)) => swap(v),
                Continuation::Throw { exception, .. } => swap(exception),
                Continuation::Jump(_) | Continuation::Return(None) => {}
            }
            for edge in cont.edges_mut() {
                edge.args.iter_mut().for_each(swap);
            }
        }
    }

    /// Successor blocks including exceptional ones.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        let b = &self.blocks[block];
        let mut succs: Vec<BlockId> = Vec::new();
        for &node in &b.body {
            if let Some(edge) = &self.nodes[node].catch {
                succs.push(edge.target);
            }
        }
        succs.extend(b.cont.edges().iter().map(|e| e.target));
        succs
    }

    /// Blocks reachable from the entry in reverse post-order.
    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        let mut visited = HashSet::new();
        let mut post = Vec::new();
        let mut stack = vec![(self.entry, false)];
        while let Some((block, done)) = stack.pop() {
            if done {
                post.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            for succ in self.successors(block).into_iter().rev() {
                if !visited.contains(&succ) {
                    stack.push((succ, false));
                }
            }
        }
        post.reverse();
        post
    }

    /// Every edge targeting a block, from reachable blocks only, as mutable
    /// references handed to `f`.
    pub fn for_each_incoming_edge(&mut self, mut f: impl FnMut(&mut Edge)) {
        let reachable = self.reachable_blocks();
        for block in reachable {
            let body = self.blocks[block].body.clone();
            for node in body {
                if let Some(edge) = &mut self.nodes[node].catch {
                    f(edge);
                }
            }
            for edge in self.blocks[block].cont.edges_mut() {
                f(edge);
            }
        }
    }

    /// Number of body nodes in reachable blocks.
    pub fn size(&self) -> usize {
        self.reachable_blocks().iter().map(|&b| self.blocks[b].body.len()).sum()
    }

    /// Human-readable listing.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "cir {}", self.key);
        let names = |ids: &[NodeId]| ids.iter().map(|i| format!("v{}", i.index())).collect::<Vec<_>>().join(", ");
        for block in self.reachable_blocks() {
            let b = &self.blocks[block];
            let tag = if b.is_handler { " handler" } else { "" };
            let _ = writeln!(out, "b{}({}){tag}:", block.index(), names(&b.params));
            for &id in &b.body {
                let node = &self.nodes[id];
                let _ = write!(out, "  v{}: {} = {:?}", id.index(), node.kind, node.op);
                if let Some(edge) = &node.catch {
                    let _ = write!(out, " catch b{}({})", edge.target.index(), names(&edge.args));
                }
                out.push('\n');
            }
            let edge = |e: &Edge| format!("b{}({})", e.target.index(), names(&e.args));
            let cont = match &b.cont {
                Continuation::Jump(e) => format!("jump {}", edge(e)),
                Continuation::Branch { cond, lhs, rhs, taken, not_taken } => format!(
                    "if v{} {cond} v{} then {} else {}",
                    lhs.index(),
                    rhs.index(),
                    edge(taken),
                    edge(not_taken)
                ),
                Continuation::Return(Some(v)) => format!("return v{}", v.index()),
                Continuation::Return(None) => "return".to_string(),
                Continuation::Throw { exception, catch } => match catch {
                    Some(e) => format!("throw v{} catch {}", exception.index(), edge(e)),
                    None => format!("throw v{}", exception.index()),
                },
            };
            let _ = writeln!(out, "  {cont}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> CirGraph {
        CirGraph::new(
            MethodKey::new("T", "m", "(I)I"),
            Signature { params: vec![Kind::Int], ret: Kind::Int },
        )
    }

    #[test]
    fn test_redirect_rewrites_all_uses() {
        let mut g = graph();
        let p = g.add_node(Operator::Control(ControlOp::Parameter(0)), Kind::Int, 0);
        let c = g.add_node(Operator::constant(Value::Int(1)), Kind::Int, 0);
        let add = g.add_node(
            Operator::Arithmetic(ArithmeticOp::Binary { op: BinaryOp::Add, lhs: p, rhs: p }),
            Kind::Int,
            0,
        );
        let entry = g.entry;
        g.blocks[entry].body = vec![p, c, add];
        g.blocks[entry].cont = Continuation::Return(Some(p));
        g.redirect(p, c);
        assert_eq!(g.nodes[add].op.inputs(), vec![c, c]);
        assert_eq!(g.blocks[entry].cont, Continuation::Return(Some(c)));
    }

    #[test]
    fn test_reachable_blocks_skip_orphans() {
        let mut g = graph();
        let a = g.add_block(1, false);
        let _orphan = g.add_block(2, false);
        let entry = g.entry;
        g.blocks[entry].cont = Continuation::Jump(Edge { target: a, args: vec![] });
        assert_eq!(g.reachable_blocks(), vec![entry, a]);
    }

    #[test]
    fn test_replace_drops_catch_for_non_throwing() {
        let mut g = graph();
        let h = g.add_block(5, true);
        let call = g.add_node(
            Operator::Invoke(InvokeOp::Static { method: MethodKey::new("T", "f", "()I"), args: vec![] }),
            Kind::Int,
            0,
        );
        g.nodes[call].catch = Some(Edge { target: h, args: vec![] });
        g.replace(call, Operator::constant(Value::Int(3)));
        assert!(g.nodes[call].catch.is_none());
    }
}

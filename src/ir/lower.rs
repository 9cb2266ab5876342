//! CIR to EIR lowering.
//!
//! Block parameters become variables assigned by moves on every incoming
//! edge. Allocation, array access and throwing become direct calls to
//! snippets. A new EIR block starts wherever the exception handler in effect
//! changes, so every block has at most one handler.

use super::bytecode::MethodKey;
use super::cir::{
    AllocationOp, ArithmeticOp, BlockId, CirGraph, Continuation, ControlOp, Edge, InvokeOp, NodeId,
    Operator,
};
use super::eir::{CallTarget, EirBlockId, EirInsn, EirMethod, Terminator, VarId, fits_move_immediate};
use super::kind::{Kind, Value};
use std::collections::{HashMap, HashSet};
use tracing::trace;

fn descriptor(kind: Kind) -> String {
    match kind {
        Kind::Reference => "Ljava/lang/Object;".to_string(),
        other => other.descriptor_char().to_string(),
    }
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Int => "Int",
        Kind::Long => "Long",
        Kind::Double => "Double",
        Kind::Reference => "Reference",
        Kind::Word => "Word",
        Kind::Void => "Void",
    }
}

/// Runtime routines that allocation, array access and throwing call.
pub mod snippets {
    use super::*;

    pub fn new_array() -> MethodKey {
        MethodKey::snippet("newArray", "(II)Ljava/lang/Object;")
    }

    pub fn new_instance() -> MethodKey {
        MethodKey::snippet("newInstance", "(Ljava/lang/Object;)Ljava/lang/Object;")
    }

    pub fn array_length() -> MethodKey {
        MethodKey::snippet("arrayLength", "(Ljava/lang/Object;)I")
    }

    pub fn array_load(element: Kind) -> MethodKey {
        MethodKey::snippet(
            &format!("arrayLoad{}", kind_name(element)),
            &format!("(Ljava/lang/Object;I){}", descriptor(element)),
        )
    }

    pub fn array_store(element: Kind) -> MethodKey {
        MethodKey::snippet(
            &format!("arrayStore{}", kind_name(element)),
            &format!("(Ljava/lang/Object;I{})V", descriptor(element)),
        )
    }

    pub fn throw_exception() -> MethodKey {
        MethodKey::snippet("throwException", "(Ljava/lang/Object;)V")
    }
}

struct Lowering<'g> {
    graph: &'g CirGraph,
    eir: EirMethod,
    vars: HashMap<NodeId, VarId>,
    entry_of: HashMap<BlockId, EirBlockId>,
}

/// Lower an optimised CIR graph.
pub fn lower(graph: &CirGraph) -> EirMethod {
    let mut lowering = Lowering {
        graph,
        eir: EirMethod::new(graph.key.clone(), graph.signature.clone()),
        vars: HashMap::new(),
        entry_of: HashMap::new(),
    };
    let order = graph.reachable_blocks();
    for &block in &order {
        let id = lowering.eir.add_block();
        lowering.eir.blocks[id].is_catch = graph.blocks[block].is_handler;
        lowering.entry_of.insert(block, id);
    }
    for &block in &order {
        lowering.lower_block(block);
    }
    trace!(method = %graph.key, blocks = lowering.eir.blocks.len(), "lowered to EIR");
    lowering.eir
}

impl Lowering<'_> {
    fn var(&mut self, node: NodeId) -> VarId {
        if let Some(&v) = self.vars.get(&node) {
            return v;
        }
        let v = self.eir.new_var(self.graph.nodes[node].kind);
        self.vars.insert(node, v);
        v
    }

    fn vars_of(&mut self, nodes: &[NodeId]) -> Vec<VarId> {
        nodes.iter().map(|&n| self.var(n)).collect()
    }

    /// Moves that pass `edge`'s arguments into its target's parameters as a
    /// parallel assignment.
    fn edge_moves(&mut self, edge: &Edge) -> Vec<EirInsn> {
        let params = self.graph.blocks[edge.target].params.clone();
        let dsts = self.vars_of(&params);
        let srcs = self.vars_of(&edge.args);
        let pairs: Vec<(VarId, VarId)> = dsts.into_iter().zip(srcs).filter(|(d, s)| d != s).collect();
        let written: HashSet<VarId> = pairs.iter().map(|&(d, _)| d).collect();
        if pairs.iter().all(|(_, s)| !written.contains(s)) {
            return pairs.into_iter().map(|(dst, src)| EirInsn::Move { dst, src }).collect();
        }
        let mut moves = Vec::with_capacity(pairs.len() * 2);
        let mut temps = Vec::with_capacity(pairs.len());
        for &(_, src) in &pairs {
            let tmp = self.eir.new_var(self.eir.vars[src].kind);
            moves.push(EirInsn::Move { dst: tmp, src });
            temps.push(tmp);
        }
        for ((dst, _), tmp) in pairs.into_iter().zip(temps) {
            moves.push(EirInsn::Move { dst, src: tmp });
        }
        moves
    }

    /// Target block for an edge, through a block holding the moves if there
    /// are any.
    fn edge_target(&mut self, edge: &Edge) -> EirBlockId {
        let target = self.entry_of[&edge.target];
        let moves = self.edge_moves(edge);
        if moves.is_empty() {
            return target;
        }
        let split = self.eir.add_block();
        self.eir.blocks[split].insns = moves;
        self.eir.blocks[split].term = Terminator::Jump(target);
        split
    }

    fn lower_block(&mut self, block: BlockId) {
        let graph = self.graph;
        let mut current = self.entry_of[&block];
        for &node in &graph.blocks[block].body {
            let n = &graph.nodes[node];
            if n.op.can_throw() {
                let handler = n.catch.as_ref().map(|e| self.entry_of[&e.target]);
                current = self.switch_handler(current, handler);
                if let Some(edge) = &n.catch {
                    let moves = self.edge_moves(edge);
                    self.eir.blocks[current].insns.extend(moves);
                }
            }
            let insns = self.lower_node(node);
            self.eir.blocks[current].insns.extend(insns);
        }
        let term = match &graph.blocks[block].cont {
            Continuation::Jump(edge) => {
                let moves = self.edge_moves(edge);
                self.eir.blocks[current].insns.extend(moves);
                Terminator::Jump(self.entry_of[&edge.target])
            }
            Continuation::Branch { cond, lhs, rhs, taken, not_taken } => {
                let kind = graph.nodes[*lhs].kind;
                let (lhs, rhs) = (self.var(*lhs), self.var(*rhs));
                let taken = self.edge_target(taken);
                let not_taken = self.edge_target(not_taken);
                Terminator::Branch { cond: *cond, kind, lhs, rhs, taken, not_taken }
            }
            Continuation::Return(value) => Terminator::Return(value.map(|v| self.var(v))),
            Continuation::Throw { exception, catch } => {
                let handler = catch.as_ref().map(|e| self.entry_of[&e.target]);
                current = self.switch_handler(current, handler);
                if let Some(edge) = catch {
                    let moves = self.edge_moves(edge);
                    self.eir.blocks[current].insns.extend(moves);
                }
                let bci = graph.nodes[*exception].bci;
                let exception = self.var(*exception);
                self.eir.blocks[current].insns.push(EirInsn::Call {
                    target: CallTarget::Direct(snippets::throw_exception()),
                    args: vec![exception],
                    result: None,
                    noreturn: true,
                    bci,
                });
                Terminator::Unreachable
            }
        };
        self.eir.blocks[current].term = term;
    }

    /// Continue in a block covered by `handler`, starting a new one if the
    /// current block already has calls under a different handler.
    fn switch_handler(&mut self, current: EirBlockId, handler: Option<EirBlockId>) -> EirBlockId {
        let block = &self.eir.blocks[current];
        if block.handler == handler {
            return current;
        }
        if !block.insns.iter().any(EirInsn::is_call) {
            self.eir.blocks[current].handler = handler;
            return current;
        }
        let next = self.eir.add_block();
        self.eir.blocks[current].term = Terminator::Jump(next);
        self.eir.blocks[next].handler = handler;
        next
    }

    fn constant(&mut self, dst: VarId, value: Value) -> EirInsn {
        if value.kind() != Kind::Reference || value == Value::Null {
            let bits = value.to_bits() as i64;
            if fits_move_immediate(bits) {
                return EirInsn::Const { dst, value };
            }
        }
        EirInsn::LoadLiteral { dst, literal: self.eir.literal(value) }
    }

    fn call(&mut self, node: NodeId, target: CallTarget, args: Vec<VarId>) -> EirInsn {
        let n = &self.graph.nodes[node];
        let (kind, bci) = (n.kind, n.bci);
        let result = (kind != Kind::Void).then(|| self.var(node));
        EirInsn::Call { target, args, result, noreturn: false, bci }
    }

    fn lower_node(&mut self, node: NodeId) -> Vec<EirInsn> {
        let graph = self.graph;
        let n = &graph.nodes[node];
        let bci = n.bci;
        match &n.op {
            Operator::Arithmetic(op) => {
                let dst = self.var(node);
                let insn = match op {
                    ArithmeticOp::Constant(value) => self.constant(dst, *value),
                    ArithmeticOp::Binary { op, lhs, rhs } => EirInsn::Arith {
                        op: *op,
                        kind: n.kind,
                        dst,
                        lhs: self.var(*lhs),
                        rhs: self.var(*rhs),
                    },
                    ArithmeticOp::Negate(x) => EirInsn::Negate { kind: n.kind, dst, src: self.var(*x) },
                    ArithmeticOp::Convert { conversion, operand } => {
                        EirInsn::Convert { conversion: *conversion, dst, src: self.var(*operand) }
                    }
                };
                vec![insn]
            }
            Operator::Control(op) => match op {
                ControlOp::Parameter(index) => vec![EirInsn::Parameter { dst: self.var(node), index: *index }],
                ControlOp::BlockParam { .. } => vec![],
                ControlOp::Safepoint => vec![EirInsn::Safepoint { bci }],
                ControlOp::CatchParameter => vec![EirInsn::CatchParameter { dst: self.var(node) }],
            },
            Operator::Allocation(op) => match op {
                AllocationOp::NewArray { element, length } => {
                    let tag = self.eir.new_var(Kind::Int);
                    let tag_insn = EirInsn::Const { dst: tag, value: Value::Int(element.element_tag()) };
                    let length = self.var(*length);
                    let call = self.call(node, CallTarget::Direct(snippets::new_array()), vec![tag, length]);
                    vec![tag_insn, call]
                }
                AllocationOp::NewInstance { class } => {
                    let hub = self.eir.new_var(Kind::Reference);
                    let load = self.constant(hub, Value::Reference(*class));
                    let call = self.call(node, CallTarget::Direct(snippets::new_instance()), vec![hub]);
                    vec![load, call]
                }
                AllocationOp::ArrayLength { array } => {
                    let args = vec![self.var(*array)];
                    vec![self.call(node, CallTarget::Direct(snippets::array_length()), args)]
                }
                AllocationOp::ArrayLoad { element, array, index } => {
                    let args = self.vars_of(&[*array, *index]);
                    vec![self.call(node, CallTarget::Direct(snippets::array_load(*element)), args)]
                }
                AllocationOp::ArrayStore { element, array, index, value } => {
                    let args = self.vars_of(&[*array, *index, *value]);
                    vec![self.call(node, CallTarget::Direct(snippets::array_store(*element)), args)]
                }
            },
            Operator::Invoke(op) => {
                let insn = match op {
                    InvokeOp::Static { method, args } => {
                        let args = self.vars_of(args);
                        self.call(node, CallTarget::Direct(method.clone()), args)
                    }
                    InvokeOp::Native { method, args } => {
                        let args = self.vars_of(args);
                        self.call(node, CallTarget::Native(method.clone()), args)
                    }
                    InvokeOp::Indirect { target, args, .. } => {
                        let args = self.vars_of(args);
                        let target = self.var(*target);
                        self.call(node, CallTarget::Indirect(target), args)
                    }
                };
                vec![insn]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::build;
    use crate::ir::bytecode::{BytecodeMethod, Comparison, Handler, Instruction};
    use crate::ir::eir::Literal;
    use crate::ir::kind::ObjectRef;

    fn method(descriptor: &str, locals: Vec<Kind>, code: Vec<Instruction>) -> BytecodeMethod {
        BytecodeMethod { key: MethodKey::new("T", "m", descriptor), locals, code, handlers: vec![] }
    }

    fn all_insns(eir: &EirMethod) -> Vec<EirInsn> {
        eir.blocks.iter().flat_map(|(_, b)| b.insns.clone()).collect()
    }

    #[test]
    fn test_large_constants_go_to_the_pool() {
        use Instruction::*;
        let m = method(
            "()J",
            vec![],
            vec![LConst(1 << 40), LConst(5), LAdd, Ldc(ObjectRef(9)), Pop, ReturnValue],
        );
        let eir = lower(&build(&m).unwrap());
        let literals: Vec<Literal> = eir.literals.iter().map(|(_, l)| *l).collect();
        assert_eq!(literals, vec![Literal::Scalar(Value::Long(1 << 40)), Literal::Reference(ObjectRef(9))]);
        assert!(all_insns(&eir).iter().any(|i| matches!(i, EirInsn::Const { value: Value::Long(5), .. })));
    }

    #[test]
    fn test_allocation_becomes_snippet_call() {
        use Instruction::*;
        let m = method("(I)Ljava/lang/Object;", vec![], vec![Load(0), NewArray(Kind::Long), ReturnValue]);
        let eir = lower(&build(&m).unwrap());
        let call = all_insns(&eir).into_iter().find(|i| i.is_call()).unwrap();
        let EirInsn::Call { target, args, result, .. } = call else { unreachable!() };
        assert_eq!(target, CallTarget::Direct(snippets::new_array()));
        assert_eq!(args.len(), 2);
        assert!(result.is_some());
        assert_eq!(snippets::array_load(Kind::Reference).descriptor, "(Ljava/lang/Object;I)Ljava/lang/Object;");
        assert_eq!(snippets::array_store(Kind::Int).name, "arrayStoreInt");
    }

    #[test]
    fn test_protected_call_gets_its_handler() {
        use Instruction::*;
        let f = MethodKey::new("T", "f", "()V");
        let mut m = method(
            "()I",
            vec![],
            vec![
                InvokeStatic(f.clone()),
                InvokeStatic(f),
                IConst(1),
                ReturnValue,
                Pop,
                IConst(2),
                ReturnValue,
            ],
        );
        m.handlers.push(Handler { start: 1, end: 2, handler: 4 });
        let eir = lower(&build(&m).unwrap());
        let covered: Vec<_> = eir.blocks.iter().filter(|(_, b)| b.handler.is_some()).collect();
        assert_eq!(covered.len(), 1);
        let handler = covered[0].1.handler.unwrap();
        assert!(eir.blocks[handler].is_catch);
        assert!(matches!(eir.blocks[handler].insns[0], EirInsn::CatchParameter { .. }));
    }

    #[test]
    fn test_throw_is_noreturn_call() {
        use Instruction::*;
        let m = method("(Ljava/lang/Object;)V", vec![], vec![Load(0), Throw]);
        let eir = lower(&build(&m).unwrap());
        let last = eir.blocks.iter().find(|(_, b)| b.term == Terminator::Unreachable).unwrap().1;
        assert!(matches!(
            last.insns.last(),
            Some(EirInsn::Call { noreturn: true, target: CallTarget::Direct(k), .. }) if *k == snippets::throw_exception()
        ));
    }

    #[test]
    fn test_swapping_edge_uses_temporaries() {
        use Instruction::*;
        // (a, b) = (b, a) around a loop.
        let m = method(
            "(II)I",
            vec![Kind::Int],
            vec![
                Load(0),
                If { cond: Comparison::Eq, target: 9 },
                Load(0),
                Store(2),
                Load(1),
                Store(0),
                Load(2),
                Store(1),
                Goto(0),
                Load(1),
                ReturnValue,
            ],
        );
        let mut graph = build(&m).unwrap();
        crate::ir::optimize::remove_trivial_params(&mut graph);
        let eir = lower(&graph);
        let widest = eir
            .blocks
            .iter()
            .map(|(_, b)| b.insns.iter().filter(|i| matches!(i, EirInsn::Move { .. })).count())
            .max();
        // Three parameters, each through a temporary.
        assert_eq!(widest, Some(6));
    }
}

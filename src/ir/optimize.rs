//! CIR optimisation passes.
//!
//! Passes rewrite the graph in place through [`CirGraph::replace`] and
//! [`CirGraph::redirect`]; node ids never change meaning for other nodes.

use super::build::{Context, Frame, is_straight_line, step_straight_line};
use super::bytecode::{BytecodeMethod, Comparison, Instruction, MethodProvider};
use super::cir::{
    ArithmeticOp, BinaryOp, BlockId, CirGraph, Continuation, ControlOp, Conversion, InvokeOp,
    NodeId, Operator,
};
use super::kind::{Kind, Value};
use std::collections::HashSet;
use tracing::debug;

/// Which passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizerOptions {
    pub inline: bool,
    /// Largest callee, in bytecode instructions, that is inlined.
    pub inline_max_nodes: usize,
    pub fold_constants: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self { inline: true, inline_max_nodes: 16, fold_constants: true }
    }
}

/// What the passes changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub inlined: usize,
    pub folded: usize,
    pub branches_folded: usize,
    pub params_removed: usize,
    pub dead_nodes: usize,
}

/// Run the configured passes.
pub fn optimize(
    graph: &mut CirGraph,
    options: &OptimizerOptions,
    provider: &dyn MethodProvider,
) -> OptimizeStats {
    let mut stats = OptimizeStats::default();
    if options.inline {
        stats.inlined = inline_snippets(graph, provider, options.inline_max_nodes);
    }
    if options.fold_constants {
        loop {
            let folded = fold_constants(graph);
            let branches = fold_branches(graph);
            let params = remove_trivial_params(graph);
            stats.folded += folded;
            stats.branches_folded += branches;
            stats.params_removed += params;
            if folded + branches + params == 0 {
                break;
            }
        }
    } else {
        stats.params_removed = remove_trivial_params(graph);
    }
    stats.dead_nodes = eliminate_dead_code(graph);
    debug!(method = %graph.key, ?stats, "optimised CIR");
    stats
}

/// Evaluate an arithmetic operator over constant inputs.
pub fn evaluate(op: &ArithmeticOp, graph: &CirGraph) -> Option<Value> {
    let constant = |id: NodeId| graph.nodes[id].op.as_constant();
    match op {
        ArithmeticOp::Constant(_) => None,
        ArithmeticOp::Binary { op, lhs, rhs } => match (constant(*lhs)?, constant(*rhs)?) {
            (Value::Int(a), Value::Int(b)) => Some(Value::Int(match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div if b != 0 => a.wrapping_div(b),
                BinaryOp::Rem if b != 0 => a.wrapping_rem(b),
                BinaryOp::Div | BinaryOp::Rem => return None,
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
            })),
            (Value::Long(a), Value::Long(b)) => Some(Value::Long(match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Div if b != 0 => a.wrapping_div(b),
                BinaryOp::Rem if b != 0 => a.wrapping_rem(b),
                BinaryOp::Div | BinaryOp::Rem => return None,
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
            })),
            (Value::Double(a), Value::Double(b)) => Some(Value::Double(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => return None,
            })),
            _ => None,
        },
        ArithmeticOp::Negate(x) => match constant(*x)? {
            Value::Int(a) => Some(Value::Int(a.wrapping_neg())),
            Value::Long(a) => Some(Value::Long(a.wrapping_neg())),
            Value::Double(a) => Some(Value::Double(-a)),
            _ => None,
        },
        ArithmeticOp::Convert { conversion, operand } => match (conversion, constant(*operand)?) {
            (Conversion::IntToLong, Value::Int(a)) => Some(Value::Long(a as i64)),
            (Conversion::LongToInt, Value::Long(a)) => Some(Value::Int(a as i32)),
            _ => None,
        },
    }
}

/// Replace arithmetic over constants with its result.
pub fn fold_constants(graph: &mut CirGraph) -> usize {
    let mut folded = 0;
    for block in graph.reachable_blocks() {
        for id in graph.blocks[block].body.clone() {
            let Operator::Arithmetic(op) = &graph.nodes[id].op else {
                continue;
            };
            if let Some(value) = evaluate(op, graph) {
                graph.replace(id, Operator::constant(value));
                folded += 1;
            }
        }
    }
    folded
}

fn decide(cond: Comparison, lhs: Value, rhs: Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(cond.eval(a, b)),
        (Value::Long(a), Value::Long(b)) => Some(cond.eval(a, b)),
        (Value::Word(a), Value::Word(b)) => Some(cond.eval(a, b)),
        (Value::Double(a), Value::Double(b)) => Some(cond.eval(a, b)),
        (a, b) if a.kind() == Kind::Reference && b.kind() == Kind::Reference => match cond {
            Comparison::Eq => Some(a == b),
            Comparison::Ne => Some(a != b),
            _ => None,
        },
        _ => None,
    }
}

/// Turn branches with a known outcome into jumps.
pub fn fold_branches(graph: &mut CirGraph) -> usize {
    let mut folded = 0;
    for block in graph.reachable_blocks() {
        let Continuation::Branch { cond, lhs, rhs, taken, not_taken } = &graph.blocks[block].cont else {
            continue;
        };
        let outcome = if lhs == rhs && graph.nodes[*lhs].kind != Kind::Double {
            Some(matches!(cond, Comparison::Eq | Comparison::Ge | Comparison::Le))
        } else {
            match (graph.nodes[*lhs].op.as_constant(), graph.nodes[*rhs].op.as_constant()) {
                (Some(a), Some(b)) => decide(*cond, a, b),
                _ => None,
            }
        };
        if let Some(take) = outcome {
            let edge = if take { taken.clone() } else { not_taken.clone() };
            graph.blocks[block].cont = Continuation::Jump(edge);
            folded += 1;
        }
    }
    folded
}

/// Remove block parameters that receive the same value on every edge (or
/// themselves), until nothing changes.
pub fn remove_trivial_params(graph: &mut CirGraph) -> usize {
    let mut removed = 0;
    loop {
        let mut changed = false;
        for block in graph.reachable_blocks() {
            if block == graph.entry {
                continue;
            }
            let mut index = graph.blocks[block].params.len();
            while index > 0 {
                index -= 1;
                if let Some(value) = trivial_value(graph, block, index) {
                    let param = graph.blocks[block].params.remove(index);
                    graph.for_each_incoming_edge(|edge| {
                        if edge.target == block {
                            edge.args.remove(index);
                        }
                    });
                    graph.redirect(param, value);
                    renumber_params(graph, block);
                    removed += 1;
                    changed = true;
                }
            }
        }
        if !changed {
            return removed;
        }
    }
}

fn trivial_value(graph: &mut CirGraph, block: BlockId, index: usize) -> Option<NodeId> {
    let param = graph.blocks[block].params[index];
    let mut unique: Option<NodeId> = None;
    let mut trivial = true;
    let mut incoming = 0;
    graph.for_each_incoming_edge(|edge| {
        if edge.target != block {
            return;
        }
        incoming += 1;
        let arg = edge.args[index];
        if arg == param {
            return;
        }
        match unique {
            None => unique = Some(arg),
            Some(v) if v == arg => {}
            Some(_) => trivial = false,
        }
    });
    if trivial && incoming > 0 { unique } else { None }
}

fn renumber_params(graph: &mut CirGraph, block: BlockId) {
    for (i, param) in graph.blocks[block].params.clone().into_iter().enumerate() {
        graph.nodes[param].op = Operator::Control(ControlOp::BlockParam { block, index: i as u16 });
    }
}

/// Drop pure nodes whose values are never used.
pub fn eliminate_dead_code(graph: &mut CirGraph) -> usize {
    let blocks = graph.reachable_blocks();
    let mut live: HashSet<NodeId> = HashSet::new();
    let mut work: Vec<NodeId> = Vec::new();
    for &block in &blocks {
        let b = &graph.blocks[block];
        for &id in &b.body {
            let node = &graph.nodes[id];
            if !node.op.is_pure() {
                work.push(id);
            }
        }
        work.extend(b.cont.inputs());
        for edge in b.cont.edges() {
            work.extend(&edge.args);
        }
    }
    while let Some(id) = work.pop() {
        if !live.insert(id) {
            continue;
        }
        let node = &graph.nodes[id];
        work.extend(node.op.inputs());
        if let Some(edge) = &node.catch {
            work.extend(&edge.args);
        }
    }
    let mut removed = 0;
    for block in blocks {
        let before = graph.blocks[block].body.len();
        let body: Vec<NodeId> = graph.blocks[block]
            .body
            .iter()
            .copied()
            .filter(|id| live.contains(id))
            .collect();
        removed += before - body.len();
        graph.blocks[block].body = body;
    }
    removed
}

/// Whether `callee` is a single-block leaf small enough to inline.
pub fn is_inlinable(callee: &BytecodeMethod, max_nodes: usize) -> bool {
    let Some((last, rest)) = callee.code.split_last() else {
        return false;
    };
    callee.handlers.is_empty()
        && callee.code.len() <= max_nodes
        && matches!(last, Instruction::Return | Instruction::ReturnValue)
        && rest.iter().all(is_straight_line)
}

/// Replace static calls to small leaf methods with their bodies.
pub fn inline_snippets(graph: &mut CirGraph, provider: &dyn MethodProvider, max_nodes: usize) -> usize {
    let mut inlined = 0;
    for block in graph.reachable_blocks() {
        let body = graph.blocks[block].body.clone();
        let mut new_body = Vec::with_capacity(body.len());
        for id in body {
            let callee = match &graph.nodes[id].op {
                Operator::Invoke(InvokeOp::Static { method, args }) if *method != graph.key => provider
                    .method(method)
                    .filter(|m| is_inlinable(m, max_nodes))
                    .map(|m| (m, args.clone())),
                _ => None,
            };
            let Some((callee, args)) = callee else {
                new_body.push(id);
                continue;
            };
            let bci = graph.nodes[id].bci;
            match expand(graph, callee, &args, bci) {
                Some((nodes, result)) => {
                    new_body.extend(nodes);
                    if let Some(result) = result {
                        graph.redirect(id, result);
                    }
                    inlined += 1;
                }
                None => new_body.push(id),
            }
        }
        graph.blocks[block].body = new_body;
    }
    inlined
}

/// Instantiate a leaf callee over `args`. Returns the new body nodes and the
/// returned value, or `None` if the callee does not fit the call.
fn expand(
    graph: &mut CirGraph,
    callee: &BytecodeMethod,
    args: &[NodeId],
    bci: usize,
) -> Option<(Vec<NodeId>, Option<NodeId>)> {
    let local_kinds = callee.local_kinds().ok()?;
    if local_kinds.len() < args.len() {
        return None;
    }
    let mut body = Vec::new();
    let mut frame = Frame { locals: args.to_vec(), stack: Vec::new() };
    for &kind in &local_kinds[args.len()..] {
        let zero = graph.add_node(Operator::constant(kind.zero()), kind, bci);
        body.push(zero);
        frame.locals.push(zero);
    }
    let ctx = Context { method: callee.key.to_string(), local_kinds: &local_kinds };
    let ret = callee.signature().ok()?.ret;
    for (pc, insn) in callee.code.iter().enumerate() {
        match insn {
            Instruction::Return => return Some((body, None)),
            Instruction::ReturnValue => {
                let value = frame.stack.pop()?;
                if graph.nodes[value].kind != ret {
                    return None;
                }
                return Some((body, Some(value)));
            }
            _ => {
                if !step_straight_line(graph, &ctx, &mut frame, insn, pc, bci, &mut body).ok()? {
                    return None;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::build;
    use crate::ir::bytecode::{MethodKey, NoMethods, Program};

    fn method(name: &str, descriptor: &str, locals: Vec<Kind>, code: Vec<Instruction>) -> BytecodeMethod {
        BytecodeMethod { key: MethodKey::new("T", name, descriptor), locals, code, handlers: vec![] }
    }

    fn returned_constant(graph: &CirGraph) -> Option<Value> {
        graph.reachable_blocks().iter().find_map(|&b| match graph.blocks[b].cont {
            Continuation::Return(Some(v)) => graph.nodes[v].op.as_constant(),
            _ => None,
        })
    }

    #[test]
    fn test_fold_wrapping_arithmetic() {
        use Instruction::*;
        let m = method("m", "()I", vec![], vec![IConst(i32::MAX), IConst(1), IAdd, ReturnValue]);
        let mut g = build(&m).unwrap();
        optimize(&mut g, &OptimizerOptions::default(), &NoMethods);
        assert_eq!(returned_constant(&g), Some(Value::Int(i32::MIN)));
    }

    #[test]
    fn test_division_by_zero_is_not_folded() {
        use Instruction::*;
        let m = method("m", "()I", vec![], vec![IConst(1), IConst(0), IDiv, ReturnValue]);
        let mut g = build(&m).unwrap();
        optimize(&mut g, &OptimizerOptions::default(), &NoMethods);
        assert_eq!(returned_constant(&g), None);
    }

    #[test]
    fn test_branch_folding_removes_dead_arm() {
        use Instruction::*;
        let m = method(
            "m",
            "()I",
            vec![],
            vec![IConst(1), If { cond: Comparison::Ne, target: 4 }, IConst(7), ReturnValue, IConst(9), ReturnValue],
        );
        let mut g = build(&m).unwrap();
        let stats = optimize(&mut g, &OptimizerOptions::default(), &NoMethods);
        assert_eq!(stats.branches_folded, 1);
        assert_eq!(returned_constant(&g), Some(Value::Int(9)));
        assert!(g.reachable_blocks().iter().all(|&b| g.blocks[b].bci != 2));
    }

    #[test]
    fn test_trivial_params_removed() {
        use Instruction::*;
        // The local is passed unchanged around the loop.
        let m = method(
            "m",
            "(I)I",
            vec![],
            vec![Load(0), If { cond: Comparison::Eq, target: 3 }, Goto(0), Load(0), ReturnValue],
        );
        let mut g = build(&m).unwrap();
        optimize(&mut g, &OptimizerOptions::default(), &NoMethods);
        for b in g.reachable_blocks() {
            if b != g.entry {
                assert!(g.blocks[b].params.is_empty(), "block b{} kept params", b.index());
            }
        }
    }

    #[test]
    fn test_inline_leaf_callee() {
        use Instruction::*;
        let twice = method("twice", "(I)I", vec![], vec![Load(0), Load(0), IAdd, ReturnValue]);
        let caller = method(
            "caller",
            "()I",
            vec![],
            vec![IConst(21), InvokeStatic(twice.key.clone()), ReturnValue],
        );
        let program = Program { methods: vec![twice, caller.clone()] };
        let mut g = build(&caller).unwrap();
        let stats = optimize(&mut g, &OptimizerOptions::default(), &program);
        assert_eq!(stats.inlined, 1);
        assert_eq!(returned_constant(&g), Some(Value::Int(42)));
        let calls = g.reachable_blocks().iter().flat_map(|&b| g.blocks[b].body.clone()).filter(|&n| {
            matches!(g.nodes[n].op, Operator::Invoke(_))
        }).count();
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_branching_callee_is_not_inlined() {
        use Instruction::*;
        let callee = method(
            "abs",
            "(I)I",
            vec![],
            vec![Load(0), If { cond: Comparison::Ge, target: 4 }, Load(0), INeg, ReturnValue],
        );
        assert!(!is_inlinable(&callee, 16));
        let small = method("id", "(I)I", vec![], vec![Load(0), ReturnValue]);
        assert!(is_inlinable(&small, 16));
        assert!(!is_inlinable(&small, 1));
    }

    #[test]
    fn test_dead_code_keeps_calls() {
        use Instruction::*;
        let m = method(
            "m",
            "(I)V",
            vec![],
            vec![Load(0), IConst(3), IMul, Pop, InvokeStatic(MethodKey::new("T", "f", "()I")), Pop, Return],
        );
        let mut g = build(&m).unwrap();
        let removed = eliminate_dead_code(&mut g);
        assert_eq!(removed, 2);
        let remaining: Vec<_> = g.reachable_blocks().iter().flat_map(|&b| g.blocks[b].body.clone()).collect();
        assert!(remaining.iter().any(|&n| matches!(g.nodes[n].op, Operator::Invoke(_))));
    }
}

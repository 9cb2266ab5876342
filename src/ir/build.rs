//! Bytecode to CIR translation.
//!
//! The operand stack is simulated with node ids: loads push the node held by
//! a local, arithmetic pops its inputs and pushes the new node. At a block
//! boundary every local and stack entry becomes an edge argument, so each
//! block starts from its own parameters.

use super::bytecode::{
    BytecodeError, BytecodeMethod, Comparison, Instruction, MAX_ARGUMENTS, MethodKey,
};
use super::cir::{
    AllocationOp, ArithmeticOp, BinaryOp, BlockId, CirGraph, Continuation, ControlOp, Conversion,
    Edge, InvokeOp, NodeId, Operator,
};
use super::kind::{Kind, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::trace;

/// Locals and operand stack during simulation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Frame {
    pub locals: Vec<NodeId>,
    pub stack: Vec<NodeId>,
}

/// Naming and local-kind context for error reporting and checks.
pub(crate) struct Context<'a> {
    pub method: String,
    pub local_kinds: &'a [Kind],
}

impl Context<'_> {
    fn underflow(&self, pc: usize) -> BytecodeError {
        BytecodeError::StackUnderflow { method: self.method.clone(), pc }
    }

    fn mismatch(&self, pc: usize, expected: Kind, found: Kind) -> BytecodeError {
        BytecodeError::KindMismatch { method: self.method.clone(), pc, expected, found }
    }
}

fn pop(graph: &CirGraph, ctx: &Context<'_>, frame: &mut Frame, pc: usize, expected: Kind) -> Result<NodeId, BytecodeError> {
    let id = frame.stack.pop().ok_or_else(|| ctx.underflow(pc))?;
    let found = graph.nodes[id].kind;
    if found != expected {
        return Err(ctx.mismatch(pc, expected, found));
    }
    Ok(id)
}

fn pop_any(ctx: &Context<'_>, frame: &mut Frame, pc: usize) -> Result<NodeId, BytecodeError> {
    frame.stack.pop().ok_or_else(|| ctx.underflow(pc))
}

/// Instructions that neither branch, call, allocate nor throw.
pub(crate) fn is_straight_line(insn: &Instruction) -> bool {
    use Instruction::*;
    matches!(
        insn,
        IConst(_) | LConst(_) | DConst(_) | AConstNull | Ldc(_) | Load(_) | Store(_) | Pop | Dup
            | IAdd | ISub | IMul | IDiv | IRem | IAnd | IOr | IXor | INeg
            | LAdd | LSub | LMul | LDiv | LRem | LAnd | LOr | LXor | LNeg
            | DAdd | DSub | DMul | DDiv | I2L | L2I
    )
}

fn binary(insn: &Instruction) -> Option<(BinaryOp, Kind)> {
    use Instruction::*;
    let r = match insn {
        IAdd => (BinaryOp::Add, Kind::Int),
        ISub => (BinaryOp::Sub, Kind::Int),
        IMul => (BinaryOp::Mul, Kind::Int),
        IDiv => (BinaryOp::Div, Kind::Int),
        IRem => (BinaryOp::Rem, Kind::Int),
        IAnd => (BinaryOp::And, Kind::Int),
        IOr => (BinaryOp::Or, Kind::Int),
        IXor => (BinaryOp::Xor, Kind::Int),
        LAdd => (BinaryOp::Add, Kind::Long),
        LSub => (BinaryOp::Sub, Kind::Long),
        LMul => (BinaryOp::Mul, Kind::Long),
        LDiv => (BinaryOp::Div, Kind::Long),
        LRem => (BinaryOp::Rem, Kind::Long),
        LAnd => (BinaryOp::And, Kind::Long),
        LOr => (BinaryOp::Or, Kind::Long),
        LXor => (BinaryOp::Xor, Kind::Long),
        DAdd => (BinaryOp::Add, Kind::Double),
        DSub => (BinaryOp::Sub, Kind::Double),
        DMul => (BinaryOp::Mul, Kind::Double),
        DDiv => (BinaryOp::Div, Kind::Double),
        _ => return None,
    };
    Some(r)
}

/// Apply one straight-line instruction. Returns `Ok(false)` without touching
/// anything if `insn` is not straight-line.
pub(crate) fn step_straight_line(
    graph: &mut CirGraph,
    ctx: &Context<'_>,
    frame: &mut Frame,
    insn: &Instruction,
    pc: usize,
    bci: usize,
    body: &mut Vec<NodeId>,
) -> Result<bool, BytecodeError> {
    let mut push_node = |graph: &mut CirGraph, frame: &mut Frame, op: Operator, kind: Kind| {
        let id = graph.add_node(op, kind, bci);
        body.push(id);
        frame.stack.push(id);
    };
    let constant = |v: Value| Operator::constant(v);

    match insn {
        Instruction::IConst(v) => push_node(graph, frame, constant(Value::Int(*v)), Kind::Int),
        Instruction::LConst(v) => push_node(graph, frame, constant(Value::Long(*v)), Kind::Long),
        Instruction::DConst(v) => push_node(graph, frame, constant(Value::Double(*v)), Kind::Double),
        Instruction::AConstNull => push_node(graph, frame, constant(Value::Null), Kind::Reference),
        Instruction::Ldc(r) => push_node(graph, frame, constant(Value::Reference(*r)), Kind::Reference),
        Instruction::Load(n) => {
            let local = *frame.locals.get(*n as usize).ok_or_else(|| BytecodeError::BadLocal {
                method: ctx.method.clone(),
                pc,
                index: *n,
            })?;
            frame.stack.push(local);
        }
        Instruction::Store(n) => {
            let kind = *ctx.local_kinds.get(*n as usize).ok_or_else(|| BytecodeError::BadLocal {
                method: ctx.method.clone(),
                pc,
                index: *n,
            })?;
            let value = pop(graph, ctx, frame, pc, kind)?;
            frame.locals[*n as usize] = value;
        }
        Instruction::Pop => {
            pop_any(ctx, frame, pc)?;
        }
        Instruction::Dup => {
            let top = *frame.stack.last().ok_or_else(|| ctx.underflow(pc))?;
            frame.stack.push(top);
        }
        Instruction::INeg | Instruction::LNeg => {
            let kind = if *insn == Instruction::INeg { Kind::Int } else { Kind::Long };
            let x = pop(graph, ctx, frame, pc, kind)?;
            push_node(graph, frame, Operator::Arithmetic(ArithmeticOp::Negate(x)), kind);
        }
        Instruction::I2L => {
            let x = pop(graph, ctx, frame, pc, Kind::Int)?;
            let op = ArithmeticOp::Convert { conversion: Conversion::IntToLong, operand: x };
            push_node(graph, frame, Operator::Arithmetic(op), Kind::Long);
        }
        Instruction::L2I => {
            let x = pop(graph, ctx, frame, pc, Kind::Long)?;
            let op = ArithmeticOp::Convert { conversion: Conversion::LongToInt, operand: x };
            push_node(graph, frame, Operator::Arithmetic(op), Kind::Int);
        }
        other => {
            let Some((op, kind)) = binary(other) else {
                return Ok(false);
            };
            let rhs = pop(graph, ctx, frame, pc, kind)?;
            let lhs = pop(graph, ctx, frame, pc, kind)?;
            push_node(graph, frame, Operator::Arithmetic(ArithmeticOp::Binary { op, lhs, rhs }), kind);
        }
    }
    Ok(true)
}

struct Builder<'m> {
    method: &'m BytecodeMethod,
    name: String,
    local_kinds: Vec<Kind>,
    graph: CirGraph,
    leaders: BTreeSet<usize>,
    block_at: HashMap<usize, BlockId>,
    started: HashSet<BlockId>,
    worklist: VecDeque<usize>,
}

/// Translate a bytecode method into CIR.
pub fn build(method: &BytecodeMethod) -> Result<CirGraph, BytecodeError> {
    let signature = method.signature()?;
    let name = method.key.to_string();
    if signature.params.len() > MAX_ARGUMENTS {
        return Err(BytecodeError::TooManyArguments { method: name, count: signature.params.len() });
    }
    let local_kinds = method.local_kinds()?;
    let mut builder = Builder {
        method,
        name,
        local_kinds,
        graph: CirGraph::new(method.key.clone(), signature),
        leaders: BTreeSet::new(),
        block_at: HashMap::new(),
        started: HashSet::new(),
        worklist: VecDeque::new(),
    };
    builder.find_leaders()?;
    builder.build_entry()?;
    while let Some(pc) = builder.worklist.pop_front() {
        builder.translate_block(pc)?;
    }
    trace!(method = %builder.name, blocks = builder.graph.blocks.len(), "built CIR");
    Ok(builder.graph)
}

impl Builder<'_> {
    fn ctx(&self) -> Context<'_> {
        Context { method: self.name.clone(), local_kinds: &self.local_kinds }
    }

    fn find_leaders(&mut self) -> Result<(), BytecodeError> {
        let method = self.method;
        let code = &method.code;
        if code.is_empty() {
            return Err(BytecodeError::FallsOffEnd { method: self.name.clone() });
        }
        self.leaders.insert(0);
        for (pc, insn) in code.iter().enumerate() {
            if let Some(target) = insn.branch_target() {
                if target >= code.len() {
                    return Err(BytecodeError::BadBranchTarget { method: self.name.clone(), pc, target });
                }
                self.leaders.insert(target);
                self.leaders.insert(pc + 1);
            } else if insn.ends_flow() {
                self.leaders.insert(pc + 1);
            }
        }
        let mut handler_pcs = HashSet::new();
        for (index, h) in method.handlers.iter().enumerate() {
            if h.start >= h.end || h.end > code.len() || h.handler >= code.len() {
                return Err(BytecodeError::BadHandler { method: self.name.clone(), index });
            }
            self.leaders.extend([h.start, h.end, h.handler]);
            handler_pcs.insert(h.handler);
        }
        self.leaders.retain(|&pc| pc < code.len());

        for &pc in &self.leaders {
            let is_handler = handler_pcs.contains(&pc);
            let block = self.graph.add_block(pc, is_handler);
            self.block_at.insert(pc, block);
        }
        // Handler blocks receive the locals; the exception is defined inside.
        for &pc in &handler_pcs {
            let block = self.block_at[&pc];
            for i in 0..self.local_kinds.len() {
                self.graph.add_param(block, self.local_kinds[i]);
            }
            self.started.insert(block);
            self.worklist.push_back(pc);
        }
        Ok(())
    }

    fn build_entry(&mut self) -> Result<(), BytecodeError> {
        let entry = self.graph.entry;
        let mut frame = Frame::default();
        let mut body = Vec::new();
        let params = self.graph.signature.params.clone();
        for (i, kind) in self.local_kinds.clone().into_iter().enumerate() {
            let op = if i < params.len() {
                Operator::Control(ControlOp::Parameter(i as u16))
            } else {
                Operator::constant(kind.zero())
            };
            let id = self.graph.add_node(op, kind, 0);
            body.push(id);
            frame.locals.push(id);
        }
        let edge = self.edge_to(0, &frame, 0)?;
        self.graph.blocks[entry].body = body;
        self.graph.blocks[entry].cont = Continuation::Jump(edge);
        Ok(())
    }

    /// Edge from the current state to the block starting at `target`.
    fn edge_to(&mut self, target: usize, frame: &Frame, pc: usize) -> Result<Edge, BytecodeError> {
        let block = *self.block_at.get(&target).ok_or(BytecodeError::BadBranchTarget {
            method: self.name.clone(),
            pc,
            target,
        })?;
        let args: Vec<NodeId> = frame.locals.iter().chain(&frame.stack).copied().collect();
        let kinds: Vec<Kind> = args.iter().map(|&a| self.graph.nodes[a].kind).collect();

        if self.graph.blocks[block].is_handler {
            // Only exception edges may enter a handler.
            return Err(BytecodeError::StackMismatch { method: self.name.clone(), pc: target });
        }
        if self.started.insert(block) {
            for &kind in &kinds {
                self.graph.add_param(block, kind);
            }
            self.worklist.push_back(target);
        } else {
            let params = &self.graph.blocks[block].params;
            let same = params.len() == kinds.len()
                && params.iter().zip(&kinds).all(|(&p, &k)| self.graph.nodes[p].kind == k);
            if !same {
                return Err(BytecodeError::StackMismatch { method: self.name.clone(), pc: target });
            }
        }
        Ok(Edge { target: block, args })
    }

    fn catch_edge(&self, pc: usize, frame: &Frame) -> Option<Edge> {
        let handler = self.method.handler_for(pc)?;
        Some(Edge { target: self.block_at[&handler.handler], args: frame.locals.clone() })
    }

    fn call_node(
        &mut self,
        op: Operator,
        kind: Kind,
        pc: usize,
        frame: &mut Frame,
        body: &mut Vec<NodeId>,
    ) -> NodeId {
        let id = self.graph.add_node(op, kind, pc);
        self.graph.nodes[id].catch = self.catch_edge(pc, frame);
        body.push(id);
        if kind != Kind::Void {
            frame.stack.push(id);
        }
        id
    }

    fn pop_args(&self, kinds: &[Kind], frame: &mut Frame, pc: usize) -> Result<Vec<NodeId>, BytecodeError> {
        let ctx = self.ctx();
        let mut args = Vec::with_capacity(kinds.len());
        for &kind in kinds.iter().rev() {
            args.push(pop(&self.graph, &ctx, frame, pc, kind)?);
        }
        args.reverse();
        Ok(args)
    }

    fn check_arity(&self, key: &MethodKey, count: usize) -> Result<(), BytecodeError> {
        if count > MAX_ARGUMENTS {
            return Err(BytecodeError::TooManyArguments { method: key.to_string(), count });
        }
        Ok(())
    }

    fn translate_block(&mut self, start: usize) -> Result<(), BytecodeError> {
        let block = self.block_at[&start];
        let method = self.method;
        let code = &method.code;
        let end = self.leaders.range(start + 1..).next().copied().unwrap_or(code.len());
        let nl = self.local_kinds.len();
        let params = self.graph.blocks[block].params.clone();
        let mut frame = Frame { locals: params[..nl].to_vec(), stack: params[nl..].to_vec() };
        let mut body = Vec::new();

        if self.graph.blocks[block].is_handler {
            let ex = self.graph.add_node(Operator::Control(ControlOp::CatchParameter), Kind::Reference, start);
            body.push(ex);
            frame.stack.push(ex);
        }

        let mut cont = None;
        for pc in start..end {
            let insn = &code[pc];
            let ctx = Context { method: self.name.clone(), local_kinds: &self.local_kinds };
            if step_straight_line(&mut self.graph, &ctx, &mut frame, insn, pc, pc, &mut body)? {
                continue;
            }
            match insn {
                Instruction::NewArray(element) => {
                    let length = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Int)?;
                    let op = Operator::Allocation(AllocationOp::NewArray { element: *element, length });
                    self.call_node(op, Kind::Reference, pc, &mut frame, &mut body);
                }
                Instruction::NewInstance(class) => {
                    let op = Operator::Allocation(AllocationOp::NewInstance { class: *class });
                    self.call_node(op, Kind::Reference, pc, &mut frame, &mut body);
                }
                Instruction::ArrayLength => {
                    let array = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Reference)?;
                    let op = Operator::Allocation(AllocationOp::ArrayLength { array });
                    self.call_node(op, Kind::Int, pc, &mut frame, &mut body);
                }
                Instruction::ArrayLoad(element) => {
                    let index = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Int)?;
                    let array = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Reference)?;
                    let op = Operator::Allocation(AllocationOp::ArrayLoad { element: *element, array, index });
                    self.call_node(op, *element, pc, &mut frame, &mut body);
                }
                Instruction::ArrayStore(element) => {
                    let value = pop(&self.graph, &self.ctx(), &mut frame, pc, *element)?;
                    let index = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Int)?;
                    let array = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Reference)?;
                    let op = Operator::Allocation(AllocationOp::ArrayStore {
                        element: *element,
                        array,
                        index,
                        value,
                    });
                    self.call_node(op, Kind::Void, pc, &mut frame, &mut body);
                }
                Instruction::InvokeStatic(key) | Instruction::InvokeNative(key) => {
                    let sig = key.signature()?;
                    self.check_arity(key, sig.params.len())?;
                    let args = self.pop_args(&sig.params, &mut frame, pc)?;
                    let op = if matches!(insn, Instruction::InvokeStatic(_)) {
                        InvokeOp::Static { method: key.clone(), args }
                    } else {
                        InvokeOp::Native { method: key.clone(), args }
                    };
                    self.call_node(Operator::Invoke(op), sig.ret, pc, &mut frame, &mut body);
                }
                Instruction::InvokeIndirect(descriptor) => {
                    let sig = super::bytecode::Signature::parse(descriptor)?;
                    if sig.params.len() > MAX_ARGUMENTS {
                        return Err(BytecodeError::TooManyArguments {
                            method: format!("{}@{pc}", self.name),
                            count: sig.params.len(),
                        });
                    }
                    let target = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Word)?;
                    let args = self.pop_args(&sig.params, &mut frame, pc)?;
                    let ret = sig.ret;
                    let op = InvokeOp::Indirect { target, signature: sig, args };
                    self.call_node(Operator::Invoke(op), ret, pc, &mut frame, &mut body);
                }
                Instruction::Safepoint => {
                    let id = self.graph.add_node(Operator::Control(ControlOp::Safepoint), Kind::Void, pc);
                    body.push(id);
                }
                Instruction::Throw => {
                    let exception = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Reference)?;
                    let catch = self.catch_edge(pc, &frame);
                    cont = Some(Continuation::Throw { exception, catch });
                }
                Instruction::Return => {
                    let ret = self.graph.signature.ret;
                    if ret != Kind::Void {
                        return Err(self.ctx().mismatch(pc, ret, Kind::Void));
                    }
                    cont = Some(Continuation::Return(None));
                }
                Instruction::ReturnValue => {
                    let ret = self.graph.signature.ret;
                    let value = pop(&self.graph, &self.ctx(), &mut frame, pc, ret)?;
                    cont = Some(Continuation::Return(Some(value)));
                }
                Instruction::Goto(target) => {
                    self.poll_if_backward(pc, *target, &mut body);
                    cont = Some(Continuation::Jump(self.edge_to(*target, &frame, pc)?));
                }
                Instruction::If { cond, target } => {
                    let lhs = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Int)?;
                    let rhs = self.graph.add_node(Operator::constant(Value::Int(0)), Kind::Int, pc);
                    body.push(rhs);
                    cont = Some(self.branch(*cond, lhs, rhs, pc, *target, &frame, &mut body)?);
                }
                Instruction::IfCmp { cond, target } => {
                    let rhs = pop_any(&self.ctx(), &mut frame, pc)?;
                    let kind = self.graph.nodes[rhs].kind;
                    let lhs = pop(&self.graph, &self.ctx(), &mut frame, pc, kind)?;
                    cont = Some(self.branch(*cond, lhs, rhs, pc, *target, &frame, &mut body)?);
                }
                Instruction::IfNull(target) | Instruction::IfNonNull(target) => {
                    let cond = if matches!(insn, Instruction::IfNull(_)) { Comparison::Eq } else { Comparison::Ne };
                    let lhs = pop(&self.graph, &self.ctx(), &mut frame, pc, Kind::Reference)?;
                    let rhs = self.graph.add_node(Operator::constant(Value::Null), Kind::Reference, pc);
                    body.push(rhs);
                    cont = Some(self.branch(cond, lhs, rhs, pc, *target, &frame, &mut body)?);
                }
                _ => unreachable!("straight-line instructions are handled above"),
            }
            if cont.is_some() {
                break;
            }
        }

        let cont = match cont {
            Some(c) => c,
            None if end >= code.len() => {
                return Err(BytecodeError::FallsOffEnd { method: self.name.clone() });
            }
            None => Continuation::Jump(self.edge_to(end, &frame, end - 1)?),
        };
        let b = &mut self.graph.blocks[block];
        b.body = body;
        b.cont = cont;
        Ok(())
    }

    fn poll_if_backward(&mut self, pc: usize, target: usize, body: &mut Vec<NodeId>) {
        if target <= pc {
            let id = self.graph.add_node(Operator::Control(ControlOp::Safepoint), Kind::Void, pc);
            body.push(id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn branch(
        &mut self,
        cond: Comparison,
        lhs: NodeId,
        rhs: NodeId,
        pc: usize,
        target: usize,
        frame: &Frame,
        body: &mut Vec<NodeId>,
    ) -> Result<Continuation, BytecodeError> {
        if pc + 1 >= self.method.code.len() {
            return Err(BytecodeError::FallsOffEnd { method: self.name.clone() });
        }
        self.poll_if_backward(pc, target, body);
        let taken = self.edge_to(target, frame, pc)?;
        let not_taken = self.edge_to(pc + 1, frame, pc)?;
        Ok(Continuation::Branch { cond, lhs, rhs, taken, not_taken })
    }
}

//! Byte emission for allocated EIR.
//!
//! Frame layout, from high to low addresses: saved frame pointer and link
//! register, then the spill slots. Slot `i` is addressed as `[sp, #8 * i]`.
//! Operands living on the stack are loaded into the scratch registers for
//! the duration of one instruction.

use super::CodegenError;
use crate::asm::{AArch64Assembler, Argument, CodeBuffer, Cond, InlineDataRecorder, InlineDataTag, Insn, Label, Reg};
use crate::ir::bytecode::{Comparison, MethodKey};
use crate::ir::cir::{BinaryOp, Conversion};
use crate::ir::eir::{CallTarget, EirBlockId, EirInsn, EirMethod, Literal, LiteralId, Terminator, VarId};
use crate::ir::kind::{Kind, Value};
use crate::regalloc::{Allocation, Location, StopKey};
use crate::target::Target;
use std::collections::HashMap;

/// Largest immediate used for one stack adjustment, keeping 16-byte
/// alignment.
const MAX_FRAME_STEP: u32 = 4080;

/// FP registers used for double arithmetic.
const FP_SCRATCH: (u8, u8) = (16, 17);

/// Bytes written after a call that does not return.
const TRAP_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopKind {
    Direct { callee: MethodKey, native: bool },
    Indirect,
    Safepoint,
}

/// A call or safepoint and the references live there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stop {
    pub kind: StopKind,
    /// Position of the call or poll instruction.
    pub position: u32,
    pub bci: usize,
    /// Spill slots holding live references.
    pub frame_refs: Vec<u32>,
    /// Register reference-map indices of registers holding live references.
    pub register_refs: Vec<usize>,
}

/// Code with literal labels still unresolved.
#[derive(Debug)]
pub struct EmittedCode {
    pub buf: CodeBuffer,
    pub literal_labels: Vec<(LiteralId, Label)>,
    /// In emission order.
    pub stops: Vec<Stop>,
    /// Range start and handler entry label, one per handler change. Empty
    /// if no block is covered by a handler.
    pub catch_ranges: Vec<(u32, Option<Label>)>,
    pub inline_data: InlineDataRecorder,
    pub frame_size: u32,
    pub frame_slots: u32,
}

pub struct Emitter<'a> {
    method: &'a EirMethod,
    alloc: &'a Allocation,
    target: &'a Target,
    buf: CodeBuffer,
    block_labels: Vec<Label>,
    literal_labels: HashMap<LiteralId, Label>,
    stops: Vec<Stop>,
    catch_ranges: Vec<(u32, Option<Label>)>,
    inline_data: InlineDataRecorder,
    frame_size: u32,
}

fn int_cond(cond: Comparison) -> Cond {
    match cond {
        Comparison::Eq => Cond::Eq,
        Comparison::Ne => Cond::Ne,
        Comparison::Lt => Cond::Lt,
        Comparison::Ge => Cond::Ge,
        Comparison::Gt => Cond::Gt,
        Comparison::Le => Cond::Le,
    }
}

/// Conditions after `fcmp` that are false for unordered operands, except
/// `ne`.
fn double_cond(cond: Comparison) -> Cond {
    match cond {
        Comparison::Eq => Cond::Eq,
        Comparison::Ne => Cond::Ne,
        Comparison::Lt => Cond::Mi,
        Comparison::Ge => Cond::Ge,
        Comparison::Gt => Cond::Gt,
        Comparison::Le => Cond::Ls,
    }
}

impl<'a> Emitter<'a> {
    pub fn new(method: &'a EirMethod, alloc: &'a Allocation, target: &'a Target) -> Self {
        let mut buf = CodeBuffer::with_capacity(method.blocks.len() * 32);
        let block_labels = method.blocks.ids().map(|_| buf.new_label()).collect();
        let frame_size = target.align_frame(alloc.frame_slots as usize * target.reference_size) as u32;
        Self {
            method,
            alloc,
            target,
            buf,
            block_labels,
            literal_labels: HashMap::new(),
            stops: Vec::new(),
            catch_ranges: Vec::new(),
            inline_data: InlineDataRecorder::new(),
            frame_size,
        }
    }

    fn asm(&mut self) -> AArch64Assembler<'_> {
        AArch64Assembler::new(&mut self.buf)
    }

    fn scratch(&self, i: usize) -> Reg {
        self.target.registers.scratch[i]
    }

    fn unsupported(&self, what: impl Into<String>) -> CodegenError {
        CodegenError::Unsupported { method: self.method.key.to_string(), what: what.into() }
    }

    pub fn emit(mut self) -> Result<EmittedCode, CodegenError> {
        let method = self.method;
        self.prologue()?;
        let has_handlers = method.has_handlers();
        if has_handlers {
            self.catch_ranges.push((0, None));
        }
        let mut current_handler = None;
        let ids: Vec<EirBlockId> = method.blocks.ids().collect();
        for (index, &id) in ids.iter().enumerate() {
            let block = &method.blocks[id];
            self.buf.bind(self.block_labels[id.index()])?;
            if has_handlers && block.handler != current_handler {
                let position = self.buf.offset() as u32;
                let label = block.handler.map(|h| self.block_labels[h.index()]);
                match self.catch_ranges.last_mut() {
                    Some(last) if last.0 == position => last.1 = label,
                    _ => self.catch_ranges.push((position, label)),
                }
                current_handler = block.handler;
            }
            for (i, insn) in block.insns.iter().enumerate() {
                self.insn(insn, (id, i))?;
            }
            let next = ids.get(index + 1).copied();
            self.terminator(&block.term, next)?;
        }
        let mut literal_labels: Vec<(LiteralId, Label)> = self.literal_labels.into_iter().collect();
        literal_labels.sort_by_key(|(id, _)| *id);
        Ok(EmittedCode {
            buf: self.buf,
            literal_labels,
            stops: self.stops,
            catch_ranges: self.catch_ranges,
            inline_data: self.inline_data,
            frame_size: self.frame_size,
            frame_slots: self.alloc.frame_slots,
        })
    }

    fn prologue(&mut self) -> Result<(), CodegenError> {
        let mut asm = self.asm();
        asm.stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16)?;
        asm.add_imm(Reg::Fp, Reg::Sp, 0)?;
        let mut remaining = self.frame_size;
        while remaining > 0 {
            let step = remaining.min(MAX_FRAME_STEP);
            self.asm().sub_imm(Reg::Sp, Reg::Sp, step as u16)?;
            remaining -= step;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<(), CodegenError> {
        let mut remaining = self.frame_size;
        while remaining > 0 {
            let step = remaining.min(MAX_FRAME_STEP);
            self.asm().add_imm(Reg::Sp, Reg::Sp, step as u16)?;
            remaining -= step;
        }
        let mut asm = self.asm();
        asm.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16)?;
        asm.ret()?;
        Ok(())
    }

    /// Register holding `var`, loading it into `scratch` if it is spilled.
    fn read(&mut self, var: VarId, scratch: Reg) -> Result<Reg, CodegenError> {
        match self.alloc.location(var) {
            Location::Register(r) => Ok(r),
            Location::Stack(slot) => {
                self.asm().ldr(scratch, Reg::Sp, slot * 8)?;
                Ok(scratch)
            }
        }
    }

    /// Register to compute `var` into.
    fn dest(&self, var: VarId, scratch: Reg) -> Reg {
        match self.alloc.location(var) {
            Location::Register(r) => r,
            Location::Stack(_) => scratch,
        }
    }

    /// Move `from` into the home of `var`.
    fn write(&mut self, var: VarId, from: Reg) -> Result<(), CodegenError> {
        match self.alloc.location(var) {
            Location::Register(r) if r == from => Ok(()),
            Location::Register(r) => Ok(self.asm().mov(r, from)?),
            Location::Stack(slot) => Ok(self.asm().str(from, Reg::Sp, slot * 8)?),
        }
    }

    fn literal_label(&mut self, literal: LiteralId) -> Label {
        if let Some(&label) = self.literal_labels.get(&literal) {
            return label;
        }
        let label = self.buf.new_label();
        self.literal_labels.insert(literal, label);
        label
    }

    fn insn(&mut self, insn: &EirInsn, key: StopKey) -> Result<(), CodegenError> {
        let (s0, s1, s2) = (self.scratch(0), self.scratch(1), self.scratch(2));
        match insn {
            EirInsn::Move { dst, src } => {
                let s = self.read(*src, s0)?;
                self.write(*dst, s)?;
            }
            EirInsn::Const { dst, value } => {
                let d = self.dest(*dst, s0);
                let bits = value.to_bits() as i64;
                if (0..=0xFFFF).contains(&bits) {
                    self.asm().mov_imm(d, bits as u16)?;
                } else if (-0x10000..0).contains(&bits) {
                    self.asm().movn(d, !bits as u16)?;
                } else {
                    return Err(self.unsupported(format!("immediate {value}")));
                }
                self.write(*dst, d)?;
            }
            EirInsn::LoadLiteral { dst, literal } => {
                let d = self.dest(*dst, s0);
                let label = self.literal_label(*literal);
                let insn = match self.method.literals[*literal] {
                    Literal::Scalar(Value::Int(_)) => Insn::LdrswLiteral,
                    _ => Insn::LdrLiteral,
                };
                self.asm().emit_to_label(insn, vec![Argument::Reg(d)], label);
                self.write(*dst, d)?;
            }
            EirInsn::Parameter { dst, index } => {
                let reg = *self
                    .target
                    .registers
                    .arguments
                    .get(*index as usize)
                    .ok_or_else(|| self.unsupported(format!("parameter {index}")))?;
                self.write(*dst, reg)?;
            }
            EirInsn::Arith { op, kind, dst, lhs, rhs } => {
                let l = self.read(*lhs, s0)?;
                let r = self.read(*rhs, s1)?;
                let d = self.dest(*dst, s0);
                if *kind == Kind::Double {
                    let (a, b) = FP_SCRATCH;
                    let mut asm = self.asm();
                    asm.fmov_to_fp(a, l)?;
                    asm.fmov_to_fp(b, r)?;
                    match op {
                        BinaryOp::Add => asm.fadd(a, a, b)?,
                        BinaryOp::Sub => asm.fsub(a, a, b)?,
                        BinaryOp::Mul => asm.fmul(a, a, b)?,
                        BinaryOp::Div => asm.fdiv(a, a, b)?,
                        other => return Err(self.unsupported(format!("double {other:?}"))),
                    }
                    self.asm().fmov_from_fp(d, a)?;
                } else {
                    let mut asm = self.asm();
                    match op {
                        BinaryOp::Add => asm.add(d, l, r)?,
                        BinaryOp::Sub => asm.sub(d, l, r)?,
                        BinaryOp::Mul => asm.mul(d, l, r)?,
                        BinaryOp::Div => asm.sdiv(d, l, r)?,
                        BinaryOp::Rem => {
                            asm.sdiv(s2, l, r)?;
                            asm.msub(d, s2, r, l)?;
                        }
                        BinaryOp::And => asm.and(d, l, r)?,
                        BinaryOp::Or => asm.orr(d, l, r)?,
                        BinaryOp::Xor => asm.eor(d, l, r)?,
                    }
                    if *kind == Kind::Int {
                        asm.sxtw(d, d)?;
                    }
                }
                self.write(*dst, d)?;
            }
            EirInsn::Negate { kind, dst, src } => {
                let s = self.read(*src, s0)?;
                let d = self.dest(*dst, s0);
                let mut asm = self.asm();
                match kind {
                    Kind::Double => {
                        asm.emit(Insn::Movz, &[Argument::Reg(s1), Argument::Imm(0x8000), Argument::Imm(48)])?;
                        asm.eor(d, s, s1)?;
                    }
                    Kind::Int => {
                        asm.neg(d, s)?;
                        asm.sxtw(d, d)?;
                    }
                    _ => asm.neg(d, s)?,
                }
                self.write(*dst, d)?;
            }
            EirInsn::Convert { conversion, dst, src } => {
                let s = self.read(*src, s0)?;
                match conversion {
                    Conversion::IntToLong => self.write(*dst, s)?,
                    Conversion::LongToInt => {
                        let d = self.dest(*dst, s0);
                        self.asm().sxtw(d, s)?;
                        self.write(*dst, d)?;
                    }
                }
            }
            EirInsn::Call { target, args, result, noreturn, bci } => {
                self.call(target, args, *bci, key)?;
                if let Some(result) = result {
                    self.write(*result, self.target.registers.return_value)?;
                }
                if *noreturn {
                    let position = self.buf.offset() as u32;
                    self.buf.emit_u32(0);
                    self.inline_data.record(InlineDataTag::ByteData, position, TRAP_SIZE);
                }
            }
            EirInsn::Safepoint { bci } => {
                let latch = self.target.registers.safepoint_latch;
                let position = self.buf.offset() as u32;
                self.asm().ldr(latch, latch, 0)?;
                self.record_stop(StopKind::Safepoint, position, *bci, key);
            }
            EirInsn::CatchParameter { dst } => {
                self.write(*dst, self.target.registers.return_value)?;
            }
        }
        Ok(())
    }

    fn call(&mut self, target: &CallTarget, args: &[VarId], bci: usize, key: StopKey) -> Result<(), CodegenError> {
        let arguments = self.target.registers.arguments.clone();
        if args.len() > arguments.len() {
            return Err(self.unsupported(format!("call with {} arguments", args.len())));
        }
        for (&arg, &reg) in args.iter().zip(&arguments) {
            match self.alloc.location(arg) {
                Location::Register(r) => self.asm().mov(reg, r)?,
                Location::Stack(slot) => self.asm().ldr(reg, Reg::Sp, slot * 8)?,
            }
        }
        let kind = match target {
            CallTarget::Direct(callee) => StopKind::Direct { callee: callee.clone(), native: false },
            CallTarget::Native(callee) => StopKind::Direct { callee: callee.clone(), native: true },
            CallTarget::Indirect(address) => {
                let s0 = self.scratch(0);
                let reg = self.read(*address, s0)?;
                if reg != s0 {
                    self.asm().mov(s0, reg)?;
                }
                StopKind::Indirect
            }
        };
        let position = self.buf.offset() as u32;
        match kind {
            // Linked once the callee is installed.
            StopKind::Direct { .. } => self.asm().bl(0)?,
            _ => {
                let target = self.scratch(0);
                self.asm().blr(target)?
            }
        }
        self.record_stop(kind, position, bci, key);
        Ok(())
    }

    fn record_stop(&mut self, kind: StopKind, position: u32, bci: usize, key: StopKey) {
        let mut frame_refs = Vec::new();
        let mut register_refs = Vec::new();
        for var in self.alloc.live_at(key) {
            if !self.method.vars[var].kind.is_reference() {
                continue;
            }
            match self.alloc.location(var) {
                Location::Stack(slot) => frame_refs.push(slot),
                Location::Register(r) => {
                    if let Some(index) = self.target.registers.reference_map_index(r) {
                        register_refs.push(index);
                    }
                }
            }
        }
        frame_refs.sort_unstable();
        register_refs.sort_unstable();
        self.stops.push(Stop { kind, position, bci, frame_refs, register_refs });
    }

    fn terminator(&mut self, term: &Terminator, next: Option<EirBlockId>) -> Result<(), CodegenError> {
        match term {
            Terminator::Jump(target) => {
                if Some(*target) != next {
                    let label = self.block_labels[target.index()];
                    self.asm().b(label);
                }
            }
            Terminator::Branch { cond, kind, lhs, rhs, taken, not_taken } => {
                let (s0, s1) = (self.scratch(0), self.scratch(1));
                let l = self.read(*lhs, s0)?;
                let r = self.read(*rhs, s1)?;
                let cond = if *kind == Kind::Double {
                    let (a, b) = FP_SCRATCH;
                    let mut asm = self.asm();
                    asm.fmov_to_fp(a, l)?;
                    asm.fmov_to_fp(b, r)?;
                    asm.fcmp(a, b)?;
                    double_cond(*cond)
                } else {
                    self.asm().cmp(l, r)?;
                    int_cond(*cond)
                };
                let taken_label = self.block_labels[taken.index()];
                let not_taken_label = self.block_labels[not_taken.index()];
                if Some(*taken) == next && *kind != Kind::Double {
                    self.asm().b_cond(cond.negate(), not_taken_label);
                } else {
                    self.asm().b_cond(cond, taken_label);
                    if Some(*not_taken) != next {
                        self.asm().b(not_taken_label);
                    }
                }
            }
            Terminator::Return(value) => {
                if let Some(value) = value {
                    let x0 = self.target.registers.return_value;
                    match self.alloc.location(*value) {
                        Location::Register(r) => self.asm().mov(x0, r)?,
                        Location::Stack(slot) => self.asm().ldr(x0, Reg::Sp, slot * 8)?,
                    }
                }
                self.epilogue()?;
            }
            Terminator::Unreachable => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Assembly, Disassembler};
    use crate::ir::bytecode::Signature;
    use crate::regalloc::allocate;

    fn single_block(ret: Kind, build: impl FnOnce(&mut EirMethod) -> (Vec<EirInsn>, Terminator)) -> EirMethod {
        let mut m = EirMethod::new(MethodKey::new("T", "m", "()V"), Signature { params: vec![], ret });
        let b = m.add_block();
        let (insns, term) = build(&mut m);
        m.blocks[b].insns = insns;
        m.blocks[b].term = term;
        m
    }

    fn listing(code: &EmittedCode) -> Vec<String> {
        Disassembler::new(Assembly::aarch64(), 0)
            .scan(code.buf.code())
            .unwrap()
            .iter()
            .map(|i| i.text())
            .collect()
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let target = Target::aarch64();
        let m = single_block(Kind::Long, |m| {
            let v = m.new_var(Kind::Long);
            (vec![EirInsn::Const { dst: v, value: Value::Long(-2) }], Terminator::Return(Some(v)))
        });
        let alloc = allocate(&m, &target.registers);
        let code = Emitter::new(&m, &alloc, &target).emit().unwrap();
        let lines = listing(&code);
        assert_eq!(lines.len(), 6, "{lines:?}");
        assert!(lines[0].starts_with("stp"), "{lines:?}");
        assert!(lines[2].starts_with("movn"), "{lines:?}");
        assert!(lines[4].starts_with("ldp"), "{lines:?}");
        assert_eq!(lines[5], "ret");
        assert_eq!(code.frame_size, 0);
    }

    #[test]
    fn test_call_records_stop_and_frame_refs() {
        let target = Target::aarch64();
        let m = single_block(Kind::Reference, |m| {
            let r = m.new_var(Kind::Reference);
            let insns = vec![
                EirInsn::Const { dst: r, value: Value::Null },
                EirInsn::Call {
                    target: CallTarget::Native(MethodKey::new("T", "n", "()V")),
                    args: vec![],
                    result: None,
                    noreturn: false,
                    bci: 5,
                },
            ];
            (insns, Terminator::Return(Some(r)))
        });
        let alloc = allocate(&m, &target.registers);
        let code = Emitter::new(&m, &alloc, &target).emit().unwrap();
        assert_eq!(code.frame_size, 16);
        assert_eq!(code.stops.len(), 1);
        let stop = &code.stops[0];
        assert_eq!(stop.kind, StopKind::Direct { callee: MethodKey::new("T", "n", "()V"), native: true });
        assert_eq!(stop.frame_refs, vec![0]);
        assert_eq!(stop.bci, 5);
        let word = u32::from_le_bytes(code.buf.code()[stop.position as usize..][..4].try_into().unwrap());
        assert_eq!(word >> 26, 0b100101);
    }

    #[test]
    fn test_noreturn_call_leaves_trap_bytes() {
        let target = Target::aarch64();
        let m = single_block(Kind::Void, |m| {
            let e = m.new_var(Kind::Reference);
            let insns = vec![
                EirInsn::Const { dst: e, value: Value::Null },
                EirInsn::Call {
                    target: CallTarget::Direct(MethodKey::new("Snippets", "throwException", "(Ljava/lang/Object;)V")),
                    args: vec![e],
                    result: None,
                    noreturn: true,
                    bci: 0,
                },
            ];
            (insns, Terminator::Unreachable)
        });
        let alloc = allocate(&m, &target.registers);
        let code = Emitter::new(&m, &alloc, &target).emit().unwrap();
        let descriptors = code.inline_data.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].end() as usize, code.buf.len());
    }

    #[test]
    fn test_branch_falls_through_to_taken_block() {
        let target = Target::aarch64();
        let mut m = EirMethod::new(MethodKey::new("T", "m", "(I)I"), Signature { params: vec![Kind::Int], ret: Kind::Int });
        let (entry, then, other) = (m.add_block(), m.add_block(), m.add_block());
        let (p, zero) = (m.new_var(Kind::Int), m.new_var(Kind::Int));
        m.blocks[entry].insns = vec![
            EirInsn::Parameter { dst: p, index: 0 },
            EirInsn::Const { dst: zero, value: Value::Int(0) },
        ];
        m.blocks[entry].term = Terminator::Branch {
            cond: Comparison::Lt,
            kind: Kind::Int,
            lhs: p,
            rhs: zero,
            taken: then,
            not_taken: other,
        };
        m.blocks[then].term = Terminator::Return(Some(zero));
        m.blocks[other].term = Terminator::Return(Some(p));
        let alloc = allocate(&m, &target.registers);
        let mut code = Emitter::new(&m, &alloc, &target).emit().unwrap();
        let bytes = code.buf.to_byte_array(Assembly::aarch64()).unwrap();
        let text = Disassembler::new(Assembly::aarch64(), 0).render(&bytes).unwrap();
        assert!(text.contains("b.ge"), "{text}");
        assert!(!text.contains("b.lt"), "{text}");
    }
}

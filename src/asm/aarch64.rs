//! AArch64 registers, the instruction catalog and a typed assembler.

use super::AssemblyError;
use super::assembly::Assembly;
use super::codebuf::{CodeBuffer, Label};
use super::template::{Argument, Constraint, OperandField as F, Syntax, Template};
use std::sync::OnceLock;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    const ALL: [Reg; 32] = [
        Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
        Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
        Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
        Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::Fp, Reg::Lr, Reg::Sp,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Reg> {
        Self::ALL.get(code as usize).copied()
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,  // Equal
    Ne = 0b0001,  // Not equal
    Cs = 0b0010,  // Carry set / unsigned higher or same
    Cc = 0b0011,  // Carry clear / unsigned lower
    Mi = 0b0100,  // Minus / negative
    Pl = 0b0101,  // Plus / positive or zero
    Vs = 0b0110,  // Overflow set
    Vc = 0b0111,  // Overflow clear
    Hi = 0b1000,  // Unsigned higher
    Ls = 0b1001,  // Unsigned lower or same
    Ge = 0b1010,  // Signed greater than or equal
    Lt = 0b1011,  // Signed less than
    Gt = 0b1100,  // Signed greater than
    Le = 0b1101,  // Signed less than or equal
    Al = 0b1110,  // Always
}

impl Cond {
    const ALL: [Cond; 15] = [
        Cond::Eq, Cond::Ne, Cond::Cs, Cond::Cc, Cond::Mi, Cond::Pl, Cond::Vs, Cond::Vc,
        Cond::Hi, Cond::Ls, Cond::Ge, Cond::Lt, Cond::Gt, Cond::Le, Cond::Al,
    ];

    /// Decode a condition field; `nv` (0b1111) has no meaning here.
    pub fn from_code(code: u8) -> Option<Cond> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Cond::Eq => "eq", Cond::Ne => "ne", Cond::Cs => "cs", Cond::Cc => "cc",
            Cond::Mi => "mi", Cond::Pl => "pl", Cond::Vs => "vs", Cond::Vc => "vc",
            Cond::Hi => "hi", Cond::Ls => "ls", Cond::Ge => "ge", Cond::Lt => "lt",
            Cond::Gt => "gt", Cond::Le => "le", Cond::Al => "al",
        }
    }

    pub fn negate(self) -> Cond {
        if self == Cond::Al {
            return Cond::Al;
        }
        Self::ALL[(self as usize) ^ 1]
    }
}

pub const NOP: u32 = 0xD503201F;

/// Every instruction form in the catalog. The discriminant is the template
/// serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Insn {
    AddReg, SubReg, SubsReg, AndReg, OrrReg, EorReg,
    Mov, Neg, Cmp,
    Madd, Msub, Mul, Sdiv, Sbfm, Sxtw,
    AddImm, SubImm, SubsImm, CmpImm,
    Movz, MovImm, Movn,
    LdrImm, StrImm, LdrPost, StrPre,
    LdrLiteral, LdrswLiteral,
    StpPre, LdpPost,
    B, Bl, BCond, Cbz, Cbnz,
    Ret, RetReg, Br, Blr, Nop,
    FmovDX, FmovXD, Fadd, Fsub, Fmul, Fdiv, Fcmp,
}

impl Insn {
    pub const ALL: [Insn; 47] = [
        Insn::AddReg, Insn::SubReg, Insn::SubsReg, Insn::AndReg, Insn::OrrReg, Insn::EorReg,
        Insn::Mov, Insn::Neg, Insn::Cmp,
        Insn::Madd, Insn::Msub, Insn::Mul, Insn::Sdiv, Insn::Sbfm, Insn::Sxtw,
        Insn::AddImm, Insn::SubImm, Insn::SubsImm, Insn::CmpImm,
        Insn::Movz, Insn::MovImm, Insn::Movn,
        Insn::LdrImm, Insn::StrImm, Insn::LdrPost, Insn::StrPre,
        Insn::LdrLiteral, Insn::LdrswLiteral,
        Insn::StpPre, Insn::LdpPost,
        Insn::B, Insn::Bl, Insn::BCond, Insn::Cbz, Insn::Cbnz,
        Insn::Ret, Insn::RetReg, Insn::Br, Insn::Blr, Insn::Nop,
        Insn::FmovDX, Insn::FmovXD, Insn::Fadd, Insn::Fsub, Insn::Fmul, Insn::Fdiv, Insn::Fcmp,
    ];

    pub fn template(self) -> &'static Template {
        Assembly::aarch64().template(self as usize)
    }

    fn describe(self) -> Template {
        let rd = F::gpr("rd", 0);
        let rn = F::gpr("rn", 5);
        let rm = F::gpr("rm", 16);
        let rd_sp = F::gpr_sp("rd", 0);
        let rn_sp = F::gpr_sp("rn", 5);
        let imm12 = F::unsigned("imm12", 10, 12, 1);
        let imm16 = F::unsigned("imm16", 5, 16, 1);
        let hw = F::unsigned("shift", 21, 2, 16);
        let simm9 = F::signed("simm9", 12, 9, 1);
        let pimm12 = F::unsigned("pimm12", 10, 12, 8);
        let simm7 = F::signed("simm7", 15, 7, 8);
        let rt2 = F::gpr("rt2", 10);
        let rel19 = F::pc_relative("label", 5, 19);
        let rel26 = F::pc_relative("label", 0, 26);
        let (dd, dn, dm) = (F::fpr("dd", 0), F::fpr("dn", 5), F::fpr("dm", 16));
        let pair_writeback = |t: Template| {
            t.constrain(Constraint::Writeback { base: 2, transfer: 0 })
                .constrain(Constraint::Writeback { base: 2, transfer: 1 })
                .with_syntax(Syntax::PreIndex)
        };

        match self {
            Insn::AddReg => Template::new("add", 0x8B000000, vec![rd, rn, rm]),
            Insn::SubReg => Template::new("sub", 0xCB000000, vec![rd, rn, rm]),
            Insn::SubsReg => Template::new("subs", 0xEB000000, vec![rd, rn, rm]),
            Insn::AndReg => Template::new("and", 0x8A000000, vec![rd, rn, rm]),
            Insn::OrrReg => Template::new("orr", 0xAA000000, vec![rd, rn, rm]),
            Insn::EorReg => Template::new("eor", 0xCA000000, vec![rd, rn, rm]),
            Insn::Mov => Template::new("mov", 0xAA0003E0, vec![rd, rm]).synthetic(),
            Insn::Neg => Template::new("neg", 0xCB0003E0, vec![rd, rm]).synthetic(),
            Insn::Cmp => Template::new("cmp", 0xEB00001F, vec![rn, rm]).synthetic(),
            Insn::Madd => Template::new("madd", 0x9B000000, vec![rd, rn, rm, F::gpr("ra", 10)]),
            Insn::Msub => Template::new("msub", 0x9B008000, vec![rd, rn, rm, F::gpr("ra", 10)]),
            Insn::Mul => Template::new("mul", 0x9B007C00, vec![rd, rn, rm]).synthetic(),
            Insn::Sdiv => Template::new("sdiv", 0x9AC00C00, vec![rd, rn, rm]),
            Insn::Sbfm => Template::new(
                "sbfm",
                0x93400000,
                vec![rd, rn, F::unsigned("immr", 16, 6, 1), F::unsigned("imms", 10, 6, 1)],
            ),
            Insn::Sxtw => Template::new("sxtw", 0x93407C00, vec![rd, rn]).synthetic(),
            Insn::AddImm => Template::new("add", 0x91000000, vec![rd_sp, rn_sp, imm12]),
            Insn::SubImm => Template::new("sub", 0xD1000000, vec![rd_sp, rn_sp, imm12]),
            Insn::SubsImm => Template::new("subs", 0xF1000000, vec![rd, rn_sp, imm12]),
            Insn::CmpImm => Template::new("cmp", 0xF100001F, vec![rn_sp, imm12]).synthetic(),
            Insn::Movz => Template::new("movz", 0xD2800000, vec![rd, imm16, hw]),
            Insn::MovImm => Template::new("mov", 0xD2800000, vec![rd, imm16]).synthetic(),
            Insn::Movn => Template::new("movn", 0x92800000, vec![rd, imm16, hw]),
            Insn::LdrImm => Template::new("ldr", 0xF9400000, vec![F::gpr("rt", 0), rn_sp, pimm12])
                .with_syntax(Syntax::Offset),
            Insn::StrImm => Template::new("str", 0xF9000000, vec![F::gpr("rt", 0), rn_sp, pimm12])
                .with_syntax(Syntax::Offset),
            Insn::LdrPost => Template::new("ldr", 0xF8400400, vec![F::gpr("rt", 0), rn_sp, simm9])
                .constrain(Constraint::Writeback { base: 1, transfer: 0 })
                .with_syntax(Syntax::PostIndex),
            Insn::StrPre => Template::new("str", 0xF8000C00, vec![F::gpr("rt", 0), rn_sp, simm9])
                .constrain(Constraint::Writeback { base: 1, transfer: 0 })
                .with_syntax(Syntax::PreIndex),
            Insn::LdrLiteral => Template::new("ldr", 0x58000000, vec![F::gpr("rt", 0), rel19]),
            Insn::LdrswLiteral => Template::new("ldrsw", 0x98000000, vec![F::gpr("rt", 0), rel19]),
            Insn::StpPre => pair_writeback(Template::new(
                "stp",
                0xA9800000,
                vec![F::gpr("rt1", 0), rt2, rn_sp, simm7],
            )),
            Insn::LdpPost => pair_writeback(Template::new(
                "ldp",
                0xA8C00000,
                vec![F::gpr("rt1", 0), rt2, rn_sp, simm7],
            ))
            .constrain(Constraint::Distinct { a: 0, b: 1 })
            .with_syntax(Syntax::PostIndex),
            Insn::B => Template::new("b", 0x14000000, vec![rel26]),
            Insn::Bl => Template::new("bl", 0x94000000, vec![rel26]),
            Insn::BCond => Template::new("b", 0x54000000, vec![F::condition("cond", 0), rel19])
                .with_syntax(Syntax::ConditionSuffix),
            Insn::Cbz => Template::new("cbz", 0xB4000000, vec![F::gpr("rt", 0), rel19]),
            Insn::Cbnz => Template::new("cbnz", 0xB5000000, vec![F::gpr("rt", 0), rel19]),
            Insn::Ret => Template::new("ret", 0xD65F03C0, vec![]).synthetic(),
            Insn::RetReg => Template::new("ret", 0xD65F0000, vec![rn]),
            Insn::Br => Template::new("br", 0xD61F0000, vec![rn]),
            Insn::Blr => Template::new("blr", 0xD63F0000, vec![rn]),
            Insn::Nop => Template::new("nop", NOP, vec![]),
            Insn::FmovDX => Template::new("fmov", 0x9E670000, vec![dd, rn]),
            Insn::FmovXD => Template::new("fmov", 0x9E660000, vec![rd, dn]),
            Insn::Fadd => Template::new("fadd", 0x1E602800, vec![dd, dn, dm]),
            Insn::Fsub => Template::new("fsub", 0x1E603800, vec![dd, dn, dm]),
            Insn::Fmul => Template::new("fmul", 0x1E600800, vec![dd, dn, dm]),
            Insn::Fdiv => Template::new("fdiv", 0x1E601800, vec![dd, dn, dm]),
            Insn::Fcmp => Template::new("fcmp", 0x1E602000, vec![dn, dm]),
        }
    }
}

impl Assembly {
    /// The shared AArch64 catalog, built on first use.
    pub fn aarch64() -> &'static Assembly {
        static CATALOG: OnceLock<Assembly> = OnceLock::new();
        CATALOG.get_or_init(|| {
            let templates = Insn::ALL.iter().map(|insn| insn.describe()).collect();
            match Assembly::new(templates) {
                Ok(assembly) => assembly,
                Err(e) => panic!("AArch64 template catalog is inconsistent: {e}"),
            }
        })
    }
}

/// AArch64 assembler.
///
/// Every instruction goes through its template, so encodings and the
/// disassembler can never disagree.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
    assembly: &'static Assembly,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf, assembly: Assembly::aarch64() }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    pub fn emit(&mut self, insn: Insn, arguments: &[Argument]) -> Result<(), AssemblyError> {
        let word = self.assembly.assemble(self.assembly.template(insn as usize), arguments)?;
        self.emit_raw(word);
        Ok(())
    }

    /// Emit `insn` with its last operand referring to `label`.
    pub fn emit_to_label(&mut self, insn: Insn, mut arguments: Vec<Argument>, label: Label) {
        let slot = arguments.len();
        arguments.push(Argument::Rel(0));
        self.buf.emit_forward_ref(insn as usize, arguments, slot, label);
    }

    fn rrr(&mut self, insn: Insn, a: Reg, b: Reg, c: Reg) -> Result<(), AssemblyError> {
        self.emit(insn, &[Argument::Reg(a), Argument::Reg(b), Argument::Reg(c)])
    }

    fn ddd(&mut self, insn: Insn, a: u8, b: u8, c: u8) -> Result<(), AssemblyError> {
        self.emit(insn, &[Argument::Fpr(a), Argument::Fpr(b), Argument::Fpr(c)])
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, Xm
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::AddReg, rd, rn, rm)
    }

    /// ADD Xd|SP, Xn|SP, #imm12
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) -> Result<(), AssemblyError> {
        self.emit(Insn::AddImm, &[Argument::Reg(rd), Argument::Reg(rn), Argument::Imm(imm12 as i64)])
    }

    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::SubReg, rd, rn, rm)
    }

    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) -> Result<(), AssemblyError> {
        self.emit(Insn::SubImm, &[Argument::Reg(rd), Argument::Reg(rn), Argument::Imm(imm12 as i64)])
    }

    pub fn neg(&mut self, rd: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.emit(Insn::Neg, &[Argument::Reg(rd), Argument::Reg(rm)])
    }

    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::Mul, rd, rn, rm)
    }

    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::Sdiv, rd, rn, rm)
    }

    /// MSUB Xd, Xn, Xm, Xa (Xa - Xn * Xm)
    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) -> Result<(), AssemblyError> {
        self.emit(
            Insn::Msub,
            &[Argument::Reg(rd), Argument::Reg(rn), Argument::Reg(rm), Argument::Reg(ra)],
        )
    }

    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::AndReg, rd, rn, rm)
    }

    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::OrrReg, rd, rn, rm)
    }

    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.rrr(Insn::EorReg, rd, rn, rm)
    }

    /// SXTW Xd, Wn
    pub fn sxtw(&mut self, rd: Reg, rn: Reg) -> Result<(), AssemblyError> {
        self.emit(Insn::Sxtw, &[Argument::Reg(rd), Argument::Reg(rn)])
    }

    /// MOV Xd, Xm (ORR Xd, XZR, Xm)
    pub fn mov(&mut self, rd: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.emit(Insn::Mov, &[Argument::Reg(rd), Argument::Reg(rm)])
    }

    /// MOV Xd, #imm16 (MOVZ)
    pub fn mov_imm(&mut self, rd: Reg, imm16: u16) -> Result<(), AssemblyError> {
        self.emit(Insn::MovImm, &[Argument::Reg(rd), Argument::Imm(imm16 as i64)])
    }

    /// MOVN Xd, #imm16 (Xd = !imm16)
    pub fn movn(&mut self, rd: Reg, imm16: u16) -> Result<(), AssemblyError> {
        self.emit(Insn::Movn, &[Argument::Reg(rd), Argument::Imm(imm16 as i64), Argument::Imm(0)])
    }

    pub fn cmp(&mut self, rn: Reg, rm: Reg) -> Result<(), AssemblyError> {
        self.emit(Insn::Cmp, &[Argument::Reg(rn), Argument::Reg(rm)])
    }

    pub fn cmp_imm(&mut self, rn: Reg, imm12: u16) -> Result<(), AssemblyError> {
        self.emit(Insn::CmpImm, &[Argument::Reg(rn), Argument::Imm(imm12 as i64)])
    }

    // ==================== Load/Store ====================

    /// LDR Xt, [Xn, #offset] (offset in bytes, multiple of 8)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: u32) -> Result<(), AssemblyError> {
        self.emit(Insn::LdrImm, &[Argument::Reg(rt), Argument::Reg(rn), Argument::Imm(offset as i64)])
    }

    pub fn str(&mut self, rt: Reg, rn: Reg, offset: u32) -> Result<(), AssemblyError> {
        self.emit(Insn::StrImm, &[Argument::Reg(rt), Argument::Reg(rn), Argument::Imm(offset as i64)])
    }

    /// LDR Xt, <label> (PC-relative literal load)
    pub fn ldr_literal(&mut self, rt: Reg, label: Label) {
        self.emit_to_label(Insn::LdrLiteral, vec![Argument::Reg(rt)], label);
    }

    /// STP Xt1, Xt2, [Xn, #imm]!
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i16) -> Result<(), AssemblyError> {
        self.emit(
            Insn::StpPre,
            &[Argument::Reg(rt1), Argument::Reg(rt2), Argument::Reg(rn), Argument::Imm(imm as i64)],
        )
    }

    /// LDP Xt1, Xt2, [Xn], #imm
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i16) -> Result<(), AssemblyError> {
        self.emit(
            Insn::LdpPost,
            &[Argument::Reg(rt1), Argument::Reg(rt2), Argument::Reg(rn), Argument::Imm(imm as i64)],
        )
    }

    // ==================== Branches ====================

    pub fn b(&mut self, label: Label) {
        self.emit_to_label(Insn::B, Vec::new(), label);
    }

    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        self.emit_to_label(Insn::BCond, vec![Argument::Cond(cond)], label);
    }

    pub fn cbz(&mut self, rt: Reg, label: Label) {
        self.emit_to_label(Insn::Cbz, vec![Argument::Reg(rt)], label);
    }

    pub fn cbnz(&mut self, rt: Reg, label: Label) {
        self.emit_to_label(Insn::Cbnz, vec![Argument::Reg(rt)], label);
    }

    /// BL to a byte offset from this instruction.
    pub fn bl(&mut self, offset: i64) -> Result<(), AssemblyError> {
        self.emit(Insn::Bl, &[Argument::Rel(offset)])
    }

    pub fn blr(&mut self, rn: Reg) -> Result<(), AssemblyError> {
        self.emit(Insn::Blr, &[Argument::Reg(rn)])
    }

    pub fn ret(&mut self) -> Result<(), AssemblyError> {
        self.emit(Insn::Ret, &[])
    }

    pub fn nop(&mut self) {
        self.emit_raw(NOP);
    }

    // ==================== Floating point ====================

    /// FMOV Dd, Xn
    pub fn fmov_to_fp(&mut self, dd: u8, rn: Reg) -> Result<(), AssemblyError> {
        self.emit(Insn::FmovDX, &[Argument::Fpr(dd), Argument::Reg(rn)])
    }

    /// FMOV Xd, Dn
    pub fn fmov_from_fp(&mut self, rd: Reg, dn: u8) -> Result<(), AssemblyError> {
        self.emit(Insn::FmovXD, &[Argument::Reg(rd), Argument::Fpr(dn)])
    }

    pub fn fadd(&mut self, dd: u8, dn: u8, dm: u8) -> Result<(), AssemblyError> {
        self.ddd(Insn::Fadd, dd, dn, dm)
    }

    pub fn fsub(&mut self, dd: u8, dn: u8, dm: u8) -> Result<(), AssemblyError> {
        self.ddd(Insn::Fsub, dd, dn, dm)
    }

    pub fn fmul(&mut self, dd: u8, dn: u8, dm: u8) -> Result<(), AssemblyError> {
        self.ddd(Insn::Fmul, dd, dn, dm)
    }

    pub fn fdiv(&mut self, dd: u8, dn: u8, dm: u8) -> Result<(), AssemblyError> {
        self.ddd(Insn::Fdiv, dd, dn, dm)
    }

    pub fn fcmp(&mut self, dn: u8, dm: u8) -> Result<(), AssemblyError> {
        self.emit(Insn::Fcmp, &[Argument::Fpr(dn), Argument::Fpr(dm)])
    }
}

/// Encode a `bl` at `from` targeting `to` (both absolute addresses).
pub fn encode_bl(from: u64, to: u64) -> Result<u32, AssemblyError> {
    let assembly = Assembly::aarch64();
    assembly.assemble(Insn::Bl.template(), &[Argument::Rel(to as i64 - from as i64)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(buf: &CodeBuffer, index: usize) -> u32 {
        let bytes = &buf.code()[index * 4..index * 4 + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_catalog_order_matches_insn() {
        let assembly = Assembly::aarch64();
        assert_eq!(assembly.templates().len(), Insn::ALL.len());
        for insn in Insn::ALL {
            assert_eq!(assembly.template(insn as usize).serial, insn as usize);
        }
    }

    #[test]
    fn test_add() {
        let mut buf = CodeBuffer::new();
        AArch64Assembler::new(&mut buf).add(Reg::X0, Reg::X1, Reg::X2).unwrap();
        assert_eq!(word(&buf, 0), 0x8B020020);
    }

    #[test]
    fn test_mov_imm() {
        let mut buf = CodeBuffer::new();
        AArch64Assembler::new(&mut buf).mov_imm(Reg::X0, 42).unwrap();
        assert_eq!(word(&buf, 0), 0xD2800540);
    }

    #[test]
    fn test_ret() {
        let mut buf = CodeBuffer::new();
        AArch64Assembler::new(&mut buf).ret().unwrap();
        assert_eq!(word(&buf, 0), 0xD65F03C0);
    }

    #[test]
    fn test_stp_ldp_frame() {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        asm.stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16).unwrap();
        asm.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16).unwrap();
        assert_eq!(word(&buf, 0), 0xA9BF7BFD);
        assert_eq!(word(&buf, 1), 0xA8C17BFD);
    }

    #[test]
    fn test_ldr_offset_must_be_scaled() {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        assert!(asm.ldr(Reg::X0, Reg::Sp, 12).is_err());
        asm.ldr(Reg::X0, Reg::Sp, 16).unwrap();
        assert_eq!(word(&buf, 0), 0xF9400BE0);
    }

    #[test]
    fn test_ldp_same_registers_rejected() {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        assert_eq!(
            asm.ldp_post(Reg::X1, Reg::X1, Reg::Sp, 16),
            Err(AssemblyError::IllegalArguments { mnemonic: "ldp" })
        );
    }

    #[test]
    fn test_encode_bl() {
        assert_eq!(encode_bl(0x1000, 0x1010).unwrap(), 0x94000004);
        assert!(encode_bl(0, 1 << 28).is_err());
    }

    #[test]
    fn test_cond_negate() {
        assert_eq!(Cond::Eq.negate(), Cond::Ne);
        assert_eq!(Cond::Lt.negate(), Cond::Ge);
        assert_eq!(Cond::from_code(15), None);
    }
}

//! Declarative instruction templates.
//!
//! A template describes one instruction form: the fixed opcode bits, the
//! operand fields in assembly-syntax order and the constraints an argument
//! list must satisfy. Both the assembler and the disassembler work from the
//! same templates, which is what makes re-assembly a usable decoding check.

use super::AssemblyError;
use super::aarch64::{Cond, Reg};
use std::fmt;

/// How the bits of an operand field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// General register; code 31 is `sp` when `sp` is set, `xzr` otherwise.
    Gpr { sp: bool },
    /// Floating-point register `d0`..`d31`.
    Fpr,
    /// Unsigned immediate, multiplied by the field scale.
    Unsigned,
    /// Two's complement immediate, multiplied by the field scale.
    Signed,
    /// Signed byte offset from the instruction, multiplied by the field scale.
    PcRelative,
    /// Condition code (`nv` is not accepted).
    Condition,
}

/// One operand field of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandField {
    pub name: &'static str,
    /// Lowest bit of the field in the instruction word.
    pub lo: u8,
    pub width: u8,
    pub kind: FieldKind,
    pub scale: u8,
}

impl OperandField {
    pub const fn gpr(name: &'static str, lo: u8) -> Self {
        Self { name, lo, width: 5, kind: FieldKind::Gpr { sp: false }, scale: 1 }
    }

    pub const fn gpr_sp(name: &'static str, lo: u8) -> Self {
        Self { name, lo, width: 5, kind: FieldKind::Gpr { sp: true }, scale: 1 }
    }

    pub const fn fpr(name: &'static str, lo: u8) -> Self {
        Self { name, lo, width: 5, kind: FieldKind::Fpr, scale: 1 }
    }

    pub const fn unsigned(name: &'static str, lo: u8, width: u8, scale: u8) -> Self {
        Self { name, lo, width, kind: FieldKind::Unsigned, scale }
    }

    pub const fn signed(name: &'static str, lo: u8, width: u8, scale: u8) -> Self {
        Self { name, lo, width, kind: FieldKind::Signed, scale }
    }

    pub const fn pc_relative(name: &'static str, lo: u8, width: u8) -> Self {
        Self { name, lo, width, kind: FieldKind::PcRelative, scale: 4 }
    }

    pub const fn condition(name: &'static str, lo: u8) -> Self {
        Self { name, lo, width: 4, kind: FieldKind::Condition, scale: 1 }
    }

    /// Bits of the instruction word occupied by this field.
    pub fn mask(&self) -> u32 {
        (((1u64 << self.width) - 1) as u32) << self.lo
    }

    fn raw_bits(&self, word: u32) -> u32 {
        (word & self.mask()) >> self.lo
    }

    /// Inclusive range of argument values this field can encode.
    pub fn value_range(&self) -> (i64, i64) {
        let scale = self.scale as i64;
        match self.kind {
            FieldKind::Gpr { .. } | FieldKind::Fpr => (0, 31),
            FieldKind::Condition => (0, 14),
            FieldKind::Unsigned => (0, ((1i64 << self.width) - 1) * scale),
            FieldKind::Signed | FieldKind::PcRelative => {
                let half = 1i64 << (self.width - 1);
                (-half * scale, (half - 1) * scale)
            }
        }
    }

    fn accepts(&self, argument: &Argument) -> bool {
        matches!(
            (self.kind, argument),
            (FieldKind::Gpr { .. }, Argument::Reg(_))
                | (FieldKind::Fpr, Argument::Fpr(_))
                | (FieldKind::Unsigned | FieldKind::Signed, Argument::Imm(_))
                | (FieldKind::PcRelative, Argument::Rel(_))
                | (FieldKind::Condition, Argument::Cond(_))
        )
    }

    /// Encode an argument into its bit position.
    pub fn encode(&self, mnemonic: &'static str, argument: &Argument) -> Result<u32, AssemblyError> {
        if !self.accepts(argument) {
            return Err(AssemblyError::ArgumentKind { mnemonic, field: self.name });
        }
        let bits = match *argument {
            Argument::Reg(reg) => reg.code() as u32,
            Argument::Fpr(n) => {
                if n > 31 {
                    return Err(AssemblyError::OutOfRange { mnemonic, field: self.name, value: n as i64 });
                }
                n as u32
            }
            Argument::Cond(cond) => cond as u32,
            Argument::Imm(value) | Argument::Rel(value) => {
                let scale = self.scale as i64;
                if value % scale != 0 {
                    return Err(AssemblyError::Misaligned { mnemonic, field: self.name, value, scale });
                }
                let (min, max) = self.value_range();
                if value < min || value > max {
                    return Err(AssemblyError::OutOfRange { mnemonic, field: self.name, value });
                }
                ((value / scale) as u32) & (((1u64 << self.width) - 1) as u32)
            }
        };
        Ok(bits << self.lo)
    }

    /// Extract the argument held by this field, or `None` if the bits have no
    /// legal interpretation.
    pub fn decode(&self, word: u32) -> Option<Argument> {
        let bits = self.raw_bits(word);
        match self.kind {
            FieldKind::Gpr { .. } => Some(Argument::Reg(Reg::from_code(bits as u8)?)),
            FieldKind::Fpr => Some(Argument::Fpr(bits as u8)),
            FieldKind::Condition => Some(Argument::Cond(Cond::from_code(bits as u8)?)),
            FieldKind::Unsigned => Some(Argument::Imm(bits as i64 * self.scale as i64)),
            FieldKind::Signed | FieldKind::PcRelative => {
                let shift = 64 - self.width as u32;
                let value = ((bits as i64) << shift) >> shift;
                let value = value * self.scale as i64;
                if self.kind == FieldKind::Signed {
                    Some(Argument::Imm(value))
                } else {
                    Some(Argument::Rel(value))
                }
            }
        }
    }

    /// Render an argument in assembly syntax. `position` is the address of
    /// the instruction, used to print absolute targets of relative operands.
    pub fn format(&self, argument: &Argument, position: u64) -> String {
        match (*argument, self.kind) {
            (Argument::Reg(reg), FieldKind::Gpr { sp }) => {
                if reg.code() == 31 {
                    if sp { "sp".to_string() } else { "xzr".to_string() }
                } else {
                    format!("x{}", reg.code())
                }
            }
            (Argument::Fpr(n), _) => format!("d{n}"),
            (Argument::Imm(v), _) => format!("#{v}"),
            (Argument::Rel(v), _) => format!("{:#x}", position.wrapping_add(v as u64)),
            (Argument::Cond(c), _) => c.name().to_string(),
            (other, _) => format!("{other:?}"),
        }
    }
}

/// A concrete operand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Argument {
    Reg(Reg),
    Fpr(u8),
    Imm(i64),
    /// Byte offset relative to the instruction's own address.
    Rel(i64),
    Cond(Cond),
}

impl Argument {
    fn numeric(&self) -> i64 {
        match *self {
            Argument::Reg(r) => r.code() as i64,
            Argument::Fpr(n) => n as i64,
            Argument::Imm(v) | Argument::Rel(v) => v,
            Argument::Cond(c) => c as i64,
        }
    }
}

/// A legality rule over a template's argument list. Field indexes refer to
/// the template's operand order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// The argument must lie in `min..=max`.
    Range { field: usize, min: i64, max: i64 },
    /// Two register arguments must differ.
    Distinct { a: usize, b: usize },
    /// A written-back base register must differ from a transfer register,
    /// unless the base is `sp`.
    Writeback { base: usize, transfer: usize },
}

impl Constraint {
    pub fn check(&self, arguments: &[Argument]) -> bool {
        match *self {
            Constraint::Range { field, min, max } => arguments
                .get(field)
                .is_some_and(|a| (min..=max).contains(&a.numeric())),
            Constraint::Distinct { a, b } => match (arguments.get(a), arguments.get(b)) {
                (Some(x), Some(y)) => x.numeric() != y.numeric(),
                _ => false,
            },
            Constraint::Writeback { base, transfer } => {
                match (arguments.get(base), arguments.get(transfer)) {
                    (Some(b), Some(t)) => b.numeric() == 31 || b.numeric() != t.numeric(),
                    _ => false,
                }
            }
        }
    }
}

/// How the operands of a template are written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// `op a, b, c`
    Plain,
    /// `op rt, [rn, #imm]` over the last two operands.
    Offset,
    /// `op rt, [rn, #imm]!`
    PreIndex,
    /// `op rt, [rn], #imm`
    PostIndex,
    /// `b.cond target`: the first operand is appended to the mnemonic.
    ConditionSuffix,
}

/// An instruction template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// Position of the template in its catalog.
    pub serial: usize,
    pub mnemonic: &'static str,
    /// Fixed opcode bits; operand field bits are zero.
    pub opcode: u32,
    pub fields: Vec<OperandField>,
    pub constraints: Vec<Constraint>,
    /// Alias of a raw form with some fields fixed (`mov`, `cmp`, `ret`...).
    pub synthetic: bool,
    pub disassemblable: bool,
    pub syntax: Syntax,
}

impl Template {
    pub fn new(mnemonic: &'static str, opcode: u32, fields: Vec<OperandField>) -> Self {
        Self {
            serial: 0,
            mnemonic,
            opcode,
            fields,
            constraints: Vec::new(),
            synthetic: false,
            disassemblable: true,
            syntax: Syntax::Plain,
        }
    }

    pub fn with_syntax(mut self, syntax: Syntax) -> Self {
        self.syntax = syntax;
        self
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn constrain(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// The operand fields in assembly-syntax order.
    pub fn parameters(&self) -> &[OperandField] {
        &self.fields
    }

    /// Union of all operand field bits.
    pub fn field_mask(&self) -> u32 {
        self.fields.iter().fold(0, |acc, f| acc | f.mask())
    }

    /// Bits that identify the instruction: everything not owned by a field.
    pub fn opcode_mask(&self) -> u32 {
        !self.field_mask()
    }

    /// Number of fixed opcode bits; higher is more specific.
    pub fn specificity(&self) -> u32 {
        self.opcode_mask().count_ones()
    }

    /// Check that the fields neither overlap each other nor the opcode bits.
    pub fn validate(&self) -> Result<(), AssemblyError> {
        let mut seen = 0u32;
        for field in &self.fields {
            if field.width == 0 || field.lo as u32 + field.width as u32 > 32 {
                return Err(AssemblyError::InconsistentTemplate {
                    mnemonic: self.mnemonic,
                    reason: format!("field {} does not fit the instruction word", field.name),
                });
            }
            if seen & field.mask() != 0 {
                return Err(AssemblyError::InconsistentTemplate {
                    mnemonic: self.mnemonic,
                    reason: format!("field {} overlaps another field", field.name),
                });
            }
            seen |= field.mask();
        }
        if self.opcode & seen != 0 {
            return Err(AssemblyError::InconsistentTemplate {
                mnemonic: self.mnemonic,
                reason: format!("opcode {:#010x} sets operand bits", self.opcode),
            });
        }
        Ok(())
    }
}

impl Template {
    /// Render `mnemonic operands` for a decoded argument list located at
    /// `position`.
    pub fn format(&self, arguments: &[Argument], position: u64) -> String {
        let texts: Vec<String> = self
            .fields
            .iter()
            .zip(arguments)
            .map(|(field, arg)| field.format(arg, position))
            .collect();
        let n = texts.len();
        match self.syntax {
            Syntax::Plain if texts.is_empty() => self.mnemonic.to_string(),
            Syntax::Plain => format!("{} {}", self.mnemonic, texts.join(", ")),
            Syntax::ConditionSuffix => {
                format!("{}.{} {}", self.mnemonic, texts[0], texts[1..].join(", "))
            }
            Syntax::Offset | Syntax::PreIndex | Syntax::PostIndex => {
                let head = texts[..n - 2].join(", ");
                let (base, offset) = (&texts[n - 2], &texts[n - 1]);
                let address = match self.syntax {
                    Syntax::Offset => format!("[{base}, {offset}]"),
                    Syntax::PreIndex => format!("[{base}, {offset}]!"),
                    _ => format!("[{base}], {offset}"),
                };
                format!("{} {head}, {address}", self.mnemonic)
            }
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for (i, field) in self.fields.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}<{}>", field.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_field_round_trip() {
        let field = OperandField::signed("imm9", 12, 9, 1);
        let bits = field.encode("ldr", &Argument::Imm(-16)).unwrap();
        assert_eq!(field.decode(bits), Some(Argument::Imm(-16)));
        assert!(field.encode("ldr", &Argument::Imm(256)).is_err());
    }

    #[test]
    fn test_scaled_field_rejects_misaligned() {
        let field = OperandField::unsigned("imm12", 10, 12, 8);
        assert!(matches!(
            field.encode("ldr", &Argument::Imm(12)),
            Err(AssemblyError::Misaligned { .. })
        ));
        assert_eq!(field.value_range(), (0, 4095 * 8));
    }

    #[test]
    fn test_condition_field_rejects_nv() {
        let field = OperandField::condition("cond", 0);
        assert_eq!(field.decode(0b1111), None);
        assert_eq!(field.decode(0b0001), Some(Argument::Cond(Cond::Ne)));
    }

    #[test]
    fn test_overlapping_fields_are_inconsistent() {
        let template = Template::new(
            "bad",
            0,
            vec![OperandField::gpr("rd", 0), OperandField::gpr("rn", 3)],
        );
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_writeback_constraint_allows_sp_base() {
        let c = Constraint::Writeback { base: 1, transfer: 0 };
        assert!(c.check(&[Argument::Reg(Reg::Sp), Argument::Reg(Reg::Sp)]));
        assert!(!c.check(&[Argument::Reg(Reg::X3), Argument::Reg(Reg::X3)]));
    }
}

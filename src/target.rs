//! Target description: architecture, data model and register conventions.

use crate::asm::Reg;
use crate::ir::kind::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    AArch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Failure to serialise a literal into the scalar literal area.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LiteralError {
    #[error("reference literal {0} cannot be stored as scalar bytes")]
    NotScalar(String),
    #[error("scalar literal at index {index} does not start at byte offset {offset}")]
    Misplaced { index: usize, offset: usize },
}

/// Sizes and byte order of values in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataModel {
    pub word_width: usize,
    pub endianness: Endianness,
}

impl DataModel {
    /// Append the memory image of a scalar value.
    pub fn write(&self, value: &Value, out: &mut Vec<u8>) -> Result<(), LiteralError> {
        let width = match value {
            Value::Int(_) => 4,
            Value::Long(_) | Value::Double(_) | Value::Word(_) => self.word_width,
            Value::Reference(_) | Value::Null => {
                return Err(LiteralError::NotScalar(value.to_string()));
            }
        };
        let bits = value.to_bits();
        match self.endianness {
            Endianness::Little => out.extend_from_slice(&bits.to_le_bytes()[..width]),
            Endianness::Big => out.extend_from_slice(&bits.to_be_bytes()[8 - width..]),
        }
        Ok(())
    }
}

/// Register roles of the calling convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterConfig {
    /// Registers available to the allocator. Also the bit order of register
    /// reference maps.
    pub allocatable: Vec<Reg>,
    pub arguments: Vec<Reg>,
    pub return_value: Reg,
    /// Scratch registers reserved for the emitter (spill reloads, constants).
    pub scratch: [Reg; 3],
    /// Holds the address of the safepoint polling page.
    pub safepoint_latch: Reg,
    pub frame_pointer: Reg,
    pub link: Reg,
    pub stack_pointer: Reg,
}

impl RegisterConfig {
    pub fn aarch64() -> Self {
        Self {
            allocatable: vec![
                Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
            ],
            arguments: vec![
                Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
            ],
            return_value: Reg::X0,
            scratch: [Reg::X16, Reg::X17, Reg::X8],
            safepoint_latch: Reg::X28,
            frame_pointer: Reg::Fp,
            link: Reg::Lr,
            stack_pointer: Reg::Sp,
        }
    }

    /// Position of `reg` in the register reference-map order.
    pub fn reference_map_index(&self, reg: Reg) -> Option<usize> {
        self.allocatable.iter().position(|&r| r == reg)
    }

    /// Bytes needed for one register reference map.
    pub fn register_map_bytes(&self) -> usize {
        self.allocatable.len().div_ceil(8)
    }
}

/// Everything the back end needs to know about the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub arch: Architecture,
    pub data_model: DataModel,
    pub reference_size: usize,
    pub stack_alignment: usize,
    /// Alignment of each region of a target bundle.
    pub bundle_alignment: usize,
    pub instruction_width: usize,
    pub page_size: usize,
    pub registers: RegisterConfig,
}

impl Target {
    pub fn aarch64() -> Self {
        Self {
            arch: Architecture::AArch64,
            data_model: DataModel { word_width: 8, endianness: Endianness::Little },
            reference_size: 8,
            stack_alignment: 16,
            bundle_alignment: 8,
            instruction_width: 4,
            page_size: 4096,
            registers: RegisterConfig::aarch64(),
        }
    }

    /// Round `size` up to the stack alignment.
    pub fn align_frame(&self, size: usize) -> usize {
        size.next_multiple_of(self.stack_alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::kind::ObjectRef;

    #[test]
    fn test_write_little_endian() {
        let model = Target::aarch64().data_model;
        let mut out = Vec::new();
        model.write(&Value::Int(-2), &mut out).unwrap();
        model.write(&Value::Long(0x0102030405060708), &mut out).unwrap();
        assert_eq!(out, vec![0xFE, 0xFF, 0xFF, 0xFF, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_references_are_not_scalar() {
        let model = Target::aarch64().data_model;
        let mut out = Vec::new();
        assert!(model.write(&Value::Reference(ObjectRef(4)), &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_register_map_order() {
        let regs = RegisterConfig::aarch64();
        assert_eq!(regs.reference_map_index(Reg::X9), Some(0));
        assert_eq!(regs.reference_map_index(Reg::X0), None);
        assert_eq!(regs.register_map_bytes(), 1);
    }
}

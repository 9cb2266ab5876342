//! Template-driven AArch64 assembler and disassembler.
//!
//! Instructions are described once as [`template::Template`]s. The assembler
//! encodes argument lists through them; the disassembler matches words
//! against them and confirms each decoding by re-assembling it.

pub mod aarch64;
pub mod assembly;
pub mod codebuf;
pub mod dis;
pub mod inline_data;
pub mod template;

pub use aarch64::{AArch64Assembler, Cond, Insn, Reg};
pub use assembly::Assembly;
pub use codebuf::{CodeBuffer, Label};
pub use dis::{AbstractionPreference, Decoded, DisassembledInstruction, Disassembler};
pub use inline_data::{InlineDataDecoder, InlineDataDescriptor, InlineDataRecorder, InlineDataTag};
pub use template::{Argument, Constraint, FieldKind, OperandField, Syntax, Template};

use thiserror::Error;

/// Errors raised while encoding instructions or resolving labels.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum AssemblyError {
    #[error("{mnemonic}: expected {expected} arguments, found {found}")]
    ArgumentCount { mnemonic: &'static str, expected: usize, found: usize },

    #[error("{mnemonic}: wrong argument kind for field {field}")]
    ArgumentKind { mnemonic: &'static str, field: &'static str },

    #[error("{mnemonic}: value {value} out of range for field {field}")]
    OutOfRange { mnemonic: &'static str, field: &'static str, value: i64 },

    #[error("{mnemonic}: value {value} for field {field} is not a multiple of {scale}")]
    Misaligned { mnemonic: &'static str, field: &'static str, value: i64, scale: i64 },

    #[error("{mnemonic}: argument list violates an operand constraint")]
    IllegalArguments { mnemonic: &'static str },

    #[error("label {0} is not bound")]
    UnboundLabel(u32),

    #[error("label {0} is already bound")]
    LabelRebound(u32),

    #[error("{mnemonic}: inconsistent template: {reason}")]
    InconsistentTemplate { mnemonic: &'static str, reason: String },
}

/// Errors raised while scanning machine code.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DisassemblyError {
    #[error("no template matches {hex} at {position:#x}")]
    NoMatch { position: u64, hex: String },

    #[error("{kind} inline data at {position:#x} is not supported")]
    UnsupportedInlineData { position: u64, kind: &'static str },

    #[error("inline data descriptor table is truncated at byte {0}")]
    TruncatedDescriptors(usize),

    #[error("unknown inline data tag {tag} at byte {offset}")]
    UnknownInlineDataTag { tag: u8, offset: usize },

    #[error("inline data descriptor at byte {offset} has invalid range start {start} size {size}")]
    BadInlineDataRange { start: u32, size: u32, offset: usize },
}

/// Lower-case hex rendering of a byte slice, as used in disassembly text.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

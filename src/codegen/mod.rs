//! EIR to machine code.
//!
//! The emitter turns an allocated EIR method into code with unresolved
//! literal labels and a record of every stop. The translator lays out the
//! bundle, resolves the labels, builds the stop, catch and reference-map
//! tables and installs the result in the code manager.

pub mod emitter;
pub mod layout;
pub mod target_method;
pub mod translator;

pub use emitter::{EmittedCode, Emitter, Stop, StopKind};
pub use layout::{ArrayField, TargetBundleLayout};
pub use target_method::{CatchTable, Generated, NATIVE_FUNCTION_CALL, TargetMethod};
pub use translator::Translator;

use crate::asm::AssemblyError;
use crate::code::CodeCacheError;
use crate::target::LiteralError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("assembler failed: {0}")]
    Assembly(#[from] AssemblyError),
    #[error("literal serialisation failed: {0}")]
    Literal(#[from] LiteralError),
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),
    #[error("{method}: catch block entry at code position 0")]
    CatchAtZero { method: String },
    #[error("{method}: bundle size {computed} differs from the size {derived} implied by the target method")]
    BundleSizeMismatch { method: String, computed: usize, derived: usize },
    #[error("{method}: cannot emit {what}")]
    Unsupported { method: String, what: String },
    #[error("{0}: code already generated")]
    AlreadyGenerated(String),
}

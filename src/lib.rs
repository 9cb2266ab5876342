//! cpsjit - a compiler back end for a small typed stack bytecode.
//!
//! Methods are built into a CPS-style graph (CIR), optimised, lowered to a
//! register-level IR (EIR), allocated and emitted as AArch64 bundles that
//! are placed, found and linked by the code manager.

pub mod asm;
pub mod code;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod gc;
pub mod ir;
pub mod regalloc;
pub mod target;

pub use code::CodeManager;
pub use codegen::TargetMethod;
pub use compiler::{CompileError, Compiler};
pub use config::CompilerConfig;
pub use ir::{BytecodeMethod, MethodKey, Program};
pub use target::Target;

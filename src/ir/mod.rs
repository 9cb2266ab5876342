//! Intermediate representations and the passes between them.
//!
//! Bytecode is built into CIR, a graph of blocks whose parameters carry
//! the values flowing along each edge. CIR is optimised in place, then
//! lowered to EIR, which has explicit variables, moves and calls.

pub mod arena;
pub mod build;
pub mod bytecode;
pub mod cir;
pub mod eir;
pub mod kind;
pub mod lower;
pub mod optimize;

pub use build::build;
pub use bytecode::{BytecodeError, BytecodeMethod, MethodKey, MethodProvider, Program};
pub use cir::CirGraph;
pub use eir::EirMethod;
pub use kind::{Kind, ObjectRef, Value};
pub use lower::lower;
pub use optimize::{OptimizeStats, OptimizerOptions, optimize};

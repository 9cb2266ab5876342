//! Collector-side structures used with generated code.

pub mod marking_stack;
pub mod roots;

pub use marking_stack::{Cell, CellVisitor, MarkingStack, MarkingStackError, OverflowHandler};
pub use roots::scan_code_roots;

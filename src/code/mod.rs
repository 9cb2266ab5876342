//! Code cache: the reserved window, its regions and the manager that
//! places, finds and links target methods.

pub mod manager;
pub mod memory;
pub mod region;

pub use manager::{BL_REACH, CodeAllocation, CodeManager};
pub use memory::{CodeWindow, MemoryError};
pub use region::{CodeRegion, MemoryRegion};

use crate::asm::AssemblyError;
use thiserror::Error;

/// Upper bound on runtime region slots.
pub const MAX_RUNTIME_REGIONS: usize = 64;

#[derive(Debug, Error)]
pub enum CodeCacheError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("code cache exhausted: {size} bytes do not fit a {region_size}-byte region ({regions} runtime regions open)")]
    Exhausted { size: usize, region_size: usize, regions: usize },
    #[error("code window of {size} bytes exceeds the {reach}-byte call reach")]
    WindowOutOfReach { size: usize, reach: usize },
    #[error("invalid code cache layout: {0}")]
    InvalidLayout(String),
    #[error("address {0:#x} is outside the code window")]
    OutsideWindow(u64),
    #[error("{0}: code not generated")]
    NotGenerated(String),
    #[error("cannot link call: {0}")]
    Link(#[from] AssemblyError),
    #[error("code manager lock poisoned")]
    Poisoned,
}

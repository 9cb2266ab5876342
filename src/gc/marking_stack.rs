//! A bounded marking worklist.
//!
//! Cells are pushed until the drain threshold is exceeded, at which point
//! the stack is drained synchronously through its [`CellVisitor`]. The last
//! slot is kept for overflow: a push that fills it hands the stack to the
//! [`OverflowHandler`], which must leave it below capacity.

use crate::config::MarkingStackConfig;
use thiserror::Error;
use tracing::trace;

/// Address of a reference slot.
pub type Cell = u64;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MarkingStackError {
    #[error("marking stack has no cell visitor")]
    NoVisitor,
    #[error("marking stack of {capacity} cells overflowed and was not recovered")]
    Overflow { capacity: usize },
    #[error("marking stack needs a capacity of at least 2 cells, got {0}")]
    InvalidCapacity(usize),
}

pub trait CellVisitor {
    /// Called for each cell popped while draining. May push more cells.
    fn visit_popped_cell(&mut self, stack: &mut MarkingStack, cell: Cell) -> Result<(), MarkingStackError>;

    /// Called for each cell left on the stack by [`MarkingStack::flush`].
    fn visit_flushed_cell(&mut self, cell: Cell);
}

pub trait OverflowHandler {
    /// Bring the stack back below capacity, for instance by recording a
    /// rescan and clearing it.
    fn recover_from_overflow(&mut self, stack: &mut MarkingStack);
}

pub struct MarkingStack {
    cells: Box<[Cell]>,
    top: usize,
    drain_threshold: usize,
    draining: bool,
    overflowing: bool,
    visitor: Option<Box<dyn CellVisitor + Send>>,
    overflow_handler: Option<Box<dyn OverflowHandler + Send>>,
}

impl MarkingStack {
    /// A stack of `capacity` cells that drains once more than
    /// `drain_threshold_percent` of it is used.
    pub fn new(capacity: usize, drain_threshold_percent: u8) -> Result<Self, MarkingStackError> {
        if capacity < 2 {
            return Err(MarkingStackError::InvalidCapacity(capacity));
        }
        let drain_threshold = capacity * drain_threshold_percent.min(100) as usize / 100;
        Ok(Self {
            cells: vec![0; capacity].into_boxed_slice(),
            top: 0,
            drain_threshold,
            draining: false,
            overflowing: false,
            visitor: None,
            overflow_handler: None,
        })
    }

    /// A stack sized by the `[marking_stack]` configuration section.
    pub fn from_config(config: &MarkingStackConfig) -> Result<Self, MarkingStackError> {
        Self::new(config.capacity, config.drain_threshold_percent)
    }

    /// Install the visitor that receives drained and flushed cells.
    pub fn set_cell_visitor(&mut self, visitor: Box<dyn CellVisitor + Send>) {
        self.visitor = Some(visitor);
    }

    /// Install the handler called when the hard capacity is reached.
    pub fn set_overflow_handler(&mut self, handler: Box<dyn OverflowHandler + Send>) {
        self.overflow_handler = Some(handler);
    }

    /// Hard capacity in cells.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of cells above which a push starts a drain.
    pub fn drain_threshold(&self) -> usize {
        self.drain_threshold
    }

    /// Cells currently on the stack.
    pub fn len(&self) -> usize {
        self.top
    }


    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// Whether a drain is in progress.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Whether `n` more pushes would start a drain.
    pub fn will_drain(&self, n: usize) -> bool {
        !self.draining && self.top + n > self.drain_threshold
    }

    /// Store `cell`, then drain or recover from overflow if a threshold is crossed.
    pub fn push(&mut self, cell: Cell) -> Result<(), MarkingStackError> {
        let capacity = self.capacity();
        let slot = self.cells.get_mut(self.top).ok_or(MarkingStackError::Overflow { capacity })?;
        *slot = cell;
        self.top += 1;
        if self.top == capacity {
            self.overflow()
        } else if self.top > self.drain_threshold && !self.draining {
            self.drain()
        } else {
            Ok(())
        }
    }

    /// Remove the top cell.
    pub fn pop(&mut self) -> Option<Cell> {
        self.top = self.top.checked_sub(1)?;
        Some(self.cells[self.top])
    }

    /// Pop and visit every cell, including cells pushed by the visitor.
    pub fn drain(&mut self) -> Result<(), MarkingStackError> {
        let mut visitor = self.visitor.take().ok_or(MarkingStackError::NoVisitor)?;
        self.draining = true;
        trace!(cells = self.top, "draining marking stack");
        let mut result = Ok(());
        while let Some(cell) = self.pop() {
            result = visitor.visit_popped_cell(self, cell);
            if result.is_err() {
                break;
            }
        }
        self.draining = false;
        self.visitor = Some(visitor);
        result
    }

    fn overflow(&mut self) -> Result<(), MarkingStackError> {
        let capacity = self.capacity();
        if self.overflowing {
            return Err(MarkingStackError::Overflow { capacity });
        }
        let mut handler = self.overflow_handler.take().ok_or(MarkingStackError::Overflow { capacity })?;
        self.overflowing = true;
        handler.recover_from_overflow(self);
        self.overflowing = false;
        self.overflow_handler = Some(handler);
        if self.top >= capacity {
            return Err(MarkingStackError::Overflow { capacity });
        }
        Ok(())
    }

    /// Visit every remaining cell as flushed, leaving the stack empty.
    pub fn flush(&mut self) -> Result<(), MarkingStackError> {
        let mut visitor = self.visitor.take().ok_or(MarkingStackError::NoVisitor)?;
        while let Some(cell) = self.pop() {
            visitor.visit_flushed_cell(cell);
        }
        self.visitor = Some(visitor);
        Ok(())
    }

    /// Drop every cell without visiting it.
    pub fn clear(&mut self) {
        self.top = 0;
    }
}

impl std::fmt::Debug for MarkingStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingStack")
            .field("capacity", &self.capacity())
            .field("top", &self.top)
            .field("drain_threshold", &self.drain_threshold)
            .field("draining", &self.draining)
            .finish()
    }
}

//! Layout of a target bundle.
//!
//! A bundle is one contiguous allocation holding, in order, the scalar
//! literal bytes, the reference literal slots and the code. Every region
//! starts at a multiple of the bundle alignment; lengths are kept exactly.

use super::target_method::TargetMethod;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayField {
    ScalarLiterals,
    ReferenceLiterals,
    Code,
}

impl ArrayField {
    pub const ALL: [ArrayField; 3] = [ArrayField::ScalarLiterals, ArrayField::ReferenceLiterals, ArrayField::Code];

    pub fn name(self) -> &'static str {
        match self {
            ArrayField::ScalarLiterals => "scalar literals",
            ArrayField::ReferenceLiterals => "reference literals",
            ArrayField::Code => "code",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cell {
    offset: usize,
    length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBundleLayout {
    cells: [Cell; 3],
    alignment: usize,
}

impl TargetBundleLayout {
    pub fn new(scalar_bytes: usize, reference_bytes: usize, code_bytes: usize, alignment: usize) -> Self {
        let mut cells = [Cell { offset: 0, length: 0 }; 3];
        let mut offset = 0;
        for (cell, length) in cells.iter_mut().zip([scalar_bytes, reference_bytes, code_bytes]) {
            *cell = Cell { offset, length };
            offset = (offset + length).next_multiple_of(alignment);
        }
        Self { cells, alignment }
    }

    /// The layout implied by a finished target method.
    pub fn from_target_method(method: &TargetMethod, reference_size: usize, alignment: usize) -> Self {
        Self::new(
            method.scalar_literals().len(),
            method.reference_literals().len() * reference_size,
            method.code().len(),
            alignment,
        )
    }

    fn cell(&self, field: ArrayField) -> Cell {
        self.cells[field as usize]
    }

    /// Offset of `field` from the bundle start.
    pub fn first_element_offset(&self, field: ArrayField) -> usize {
        self.cell(field).offset
    }

    pub fn length(&self, field: ArrayField) -> usize {
        self.cell(field).length
    }

    pub fn end(&self, field: ArrayField) -> usize {
        let cell = self.cell(field);
        cell.offset + cell.length
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Total bytes to allocate for the bundle.
    pub fn bundle_size(&self) -> usize {
        self.end(ArrayField::Code).next_multiple_of(self.alignment)
    }
}

impl fmt::Display for TargetBundleLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in ArrayField::ALL {
            writeln!(
                f,
                "{:<20} [{:#06x}, {:#06x})",
                field.name(),
                self.first_element_offset(field),
                self.end(field)
            )?;
        }
        write!(f, "{:<20} {}", "bundle size", self.bundle_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_are_aligned() {
        let layout = TargetBundleLayout::new(12, 16, 40, 8);
        assert_eq!(layout.first_element_offset(ArrayField::ScalarLiterals), 0);
        assert_eq!(layout.first_element_offset(ArrayField::ReferenceLiterals), 16);
        assert_eq!(layout.first_element_offset(ArrayField::Code), 32);
        assert_eq!(layout.length(ArrayField::ScalarLiterals), 12);
        assert_eq!(layout.bundle_size(), 72);
    }

    #[test]
    fn test_empty_literal_areas() {
        let layout = TargetBundleLayout::new(0, 0, 20, 8);
        assert_eq!(layout.first_element_offset(ArrayField::Code), 0);
        assert_eq!(layout.bundle_size(), 24);
    }
}

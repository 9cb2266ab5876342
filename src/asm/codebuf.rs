//! Code buffer for building machine code.
//!
//! Instructions that refer to labels are emitted as placeholders and
//! re-assembled once every label has an address. A label is either bound to
//! a position inside the buffer or fixed to an address relative to the
//! bundle start (literals live outside the code region).

use super::AssemblyError;
use super::assembly::Assembly;
use super::template::Argument;

/// A code label handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelState {
    Unbound,
    /// Offset inside the code buffer.
    Bound(u32),
    /// Address relative to the start of the bundle.
    Fixed(u64),
}

/// A placeholder instruction waiting for its label.
#[derive(Debug, Clone)]
struct ForwardRef {
    offset: usize,
    label: Label,
    template: usize,
    arguments: Vec<Argument>,
    /// Index of the relative operand inside `arguments`.
    slot: usize,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    forward_refs: Vec<ForwardRef>,
    /// Offset of the first code byte from the bundle start.
    start_address: u64,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { code: Vec::with_capacity(capacity), ..Self::default() }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::Unbound);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current position.
    pub fn bind(&mut self, label: Label) -> Result<(), AssemblyError> {
        let position = self.code.len() as u32;
        match self.labels.get_mut(label.0 as usize) {
            Some(state @ LabelState::Unbound) => {
                *state = LabelState::Bound(position);
                Ok(())
            }
            Some(_) => Err(AssemblyError::LabelRebound(label.0)),
            None => Err(AssemblyError::UnboundLabel(label.0)),
        }
    }

    /// Fix `label` to an address relative to the bundle start. May be called
    /// again to move the label.
    pub fn fix_label(&mut self, label: Label, address: u64) -> Result<(), AssemblyError> {
        match self.labels.get_mut(label.0 as usize) {
            Some(state) => {
                *state = LabelState::Fixed(address);
                Ok(())
            }
            None => Err(AssemblyError::UnboundLabel(label.0)),
        }
    }

    /// Position of a bound label inside the code.
    pub fn label_position(&self, label: Label) -> Result<u32, AssemblyError> {
        match self.labels.get(label.0 as usize) {
            Some(LabelState::Bound(position)) => Ok(*position),
            _ => Err(AssemblyError::UnboundLabel(label.0)),
        }
    }

    /// Address of a label relative to the bundle start.
    pub fn label_address(&self, label: Label) -> Result<u64, AssemblyError> {
        match self.labels.get(label.0 as usize) {
            Some(LabelState::Bound(position)) => Ok(self.start_address + *position as u64),
            Some(LabelState::Fixed(address)) => Ok(*address),
            _ => Err(AssemblyError::UnboundLabel(label.0)),
        }
    }

    pub fn set_start_address(&mut self, address: u64) {
        self.start_address = address;
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    /// Emit a placeholder for an instruction whose operand `slot` is the
    /// distance to `label`.
    pub fn emit_forward_ref(
        &mut self,
        template: usize,
        arguments: Vec<Argument>,
        slot: usize,
        label: Label,
    ) {
        let offset = self.code.len();
        self.forward_refs.push(ForwardRef { offset, label, template, arguments, slot });
        self.emit_u32(0);
    }

    /// Re-assemble every placeholder against the current label addresses.
    pub fn patch_forward_refs(&mut self, assembly: &Assembly) -> Result<(), AssemblyError> {
        for fref in &self.forward_refs {
            let target = self.label_address(fref.label)?;
            let here = self.start_address + fref.offset as u64;
            let mut arguments = fref.arguments.clone();
            arguments[fref.slot] = Argument::Rel(target as i64 - here as i64);
            let word = assembly.assemble(assembly.template(fref.template), &arguments)?;
            self.code[fref.offset..fref.offset + 4].copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Produce the final code bytes. Placeholders are kept, so the buffer
    /// can be re-patched after labels move.
    pub fn to_byte_array(&mut self, assembly: &Assembly) -> Result<Vec<u8>, AssemblyError> {
        self.patch_forward_refs(assembly)?;
        Ok(self.code.clone())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Align the code to `alignment` bytes with `nop`s.
    pub fn align(&mut self, alignment: usize) {
        while self.code.len() % alignment != 0 {
            self.emit_u32(super::aarch64::NOP);
        }
    }
}

//! Data embedded in the instruction stream.
//!
//! The emitter records where it places non-instruction bytes; the
//! disassembler uses the recorded descriptors to print them as data instead
//! of trying to decode them.

use super::DisassemblyError;
use std::collections::BTreeMap;

/// Kinds of inline data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InlineDataTag {
    ByteData = 0,
    JumpTable32 = 1,
    LookupTable32 = 2,
}

impl InlineDataTag {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(InlineDataTag::ByteData),
            1 => Some(InlineDataTag::JumpTable32),
            2 => Some(InlineDataTag::LookupTable32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InlineDataTag::ByteData => "byte",
            InlineDataTag::JumpTable32 => "jump table",
            InlineDataTag::LookupTable32 => "lookup table",
        }
    }
}

/// One run of inline data, positioned relative to the start of the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineDataDescriptor {
    pub tag: InlineDataTag,
    pub start: u32,
    pub size: u32,
}

impl InlineDataDescriptor {
    /// Encoded size in bytes: tag, start (u32 LE), size (u32 LE).
    pub const ENCODED_SIZE: usize = 9;

    /// First position after the data. Saturates instead of wrapping.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.size)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.tag as u8);
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}

/// Collects descriptors during emission.
#[derive(Debug, Default, Clone)]
pub struct InlineDataRecorder {
    descriptors: Vec<InlineDataDescriptor>,
}

impl InlineDataRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tag: InlineDataTag, start: u32, size: u32) {
        if size > 0 {
            self.descriptors.push(InlineDataDescriptor { tag, start, size });
        }
    }

    pub fn descriptors(&self) -> &[InlineDataDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Serialise every descriptor, in recording order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.descriptors.len() * InlineDataDescriptor::ENCODED_SIZE);
        for descriptor in &self.descriptors {
            descriptor.write(&mut out);
        }
        out
    }
}

/// Position-indexed view of recorded descriptors.
#[derive(Debug, Default, Clone)]
pub struct InlineDataDecoder {
    by_start: BTreeMap<u32, InlineDataDescriptor>,
}

impl InlineDataDecoder {
    /// Index `descriptors` by start position. Empty runs are dropped.
    pub fn new(descriptors: &[InlineDataDescriptor]) -> Self {
        Self { by_start: descriptors.iter().filter(|d| d.size > 0).map(|d| (d.start, *d)).collect() }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DisassemblyError> {
        if bytes.len() % InlineDataDescriptor::ENCODED_SIZE != 0 {
            let whole = bytes.len() - bytes.len() % InlineDataDescriptor::ENCODED_SIZE;
            return Err(DisassemblyError::TruncatedDescriptors(whole));
        }
        let mut descriptors = Vec::new();
        for (i, chunk) in bytes.chunks_exact(InlineDataDescriptor::ENCODED_SIZE).enumerate() {
            let offset = i * InlineDataDescriptor::ENCODED_SIZE;
            let tag = InlineDataTag::from_u8(chunk[0])
                .ok_or(DisassemblyError::UnknownInlineDataTag { tag: chunk[0], offset })?;
            let start = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
            let size = u32::from_le_bytes([chunk[5], chunk[6], chunk[7], chunk[8]]);
            // Runs are non-empty and end inside the u32 code space.
            if size == 0 || start.checked_add(size).is_none() {
                return Err(DisassemblyError::BadInlineDataRange { start, size, offset });
            }
            descriptors.push(InlineDataDescriptor { tag, start, size });
        }
        Ok(Self::new(&descriptors))
    }

    /// The descriptor starting exactly at `position`, if any.
    pub fn descriptor_at(&self, position: u32) -> Option<&InlineDataDescriptor> {
        self.by_start.get(&position)
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_layout() {
        let mut recorder = InlineDataRecorder::new();
        recorder.record(InlineDataTag::ByteData, 0x10, 4);
        let bytes = recorder.encode();
        assert_eq!(bytes, vec![0, 0x10, 0, 0, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn test_decode_finds_descriptor() {
        let mut recorder = InlineDataRecorder::new();
        recorder.record(InlineDataTag::ByteData, 8, 4);
        recorder.record(InlineDataTag::JumpTable32, 20, 8);
        recorder.record(InlineDataTag::ByteData, 40, 0);
        let decoder = InlineDataDecoder::decode(&recorder.encode()).unwrap();
        assert_eq!(decoder.descriptor_at(20).map(|d| d.tag), Some(InlineDataTag::JumpTable32));
        assert!(decoder.descriptor_at(40).is_none());
    }

    #[test]
    fn test_decode_rejects_empty_and_overflowing_runs() {
        let mut empty = Vec::new();
        InlineDataDescriptor { tag: InlineDataTag::ByteData, start: 8, size: 0 }.write(&mut empty);
        assert_eq!(
            InlineDataDecoder::decode(&empty).unwrap_err(),
            DisassemblyError::BadInlineDataRange { start: 8, size: 0, offset: 0 }
        );

        let mut wrapping = Vec::new();
        InlineDataDescriptor { tag: InlineDataTag::ByteData, start: 4, size: 4 }.write(&mut wrapping);
        InlineDataDescriptor { tag: InlineDataTag::ByteData, start: u32::MAX - 2, size: 4 }.write(&mut wrapping);
        assert!(matches!(
            InlineDataDecoder::decode(&wrapping),
            Err(DisassemblyError::BadInlineDataRange { offset: 9, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(InlineDataDecoder::decode(&[0, 1, 2]).is_err());
        assert_eq!(
            InlineDataDecoder::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            DisassemblyError::UnknownInlineDataTag { tag: 9, offset: 0 }
        );
    }
}

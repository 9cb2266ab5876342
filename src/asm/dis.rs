//! Template-matching disassembler.
//!
//! A word is decoded by walking the catalog from the most specific group to
//! the least specific one, matching opcode bits under each mask, extracting
//! the operand fields and accepting a candidate only if it re-assembles to
//! the same word.

use super::assembly::Assembly;
use super::inline_data::{InlineDataDecoder, InlineDataTag};
use super::template::{Argument, Template};
use super::{DisassemblyError, hex};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

const INSTRUCTION_WIDTH: usize = 4;
const MAX_DATA_CHUNK: usize = 4;

/// Which of several matching decodings to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbstractionPreference {
    /// Prefer aliases such as `mov` and `cmp`.
    #[default]
    Synthetic,
    /// Only report raw forms.
    Raw,
}

/// What a disassembled entry holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<'a> {
    Instruction { template: &'a Template, arguments: Vec<Argument> },
    /// Bytes that are data, or that no template accepts.
    InlineBytes,
}

/// One line of disassembly.
#[derive(Debug, Clone, PartialEq)]
pub struct DisassembledInstruction<'a> {
    /// Absolute address of the first byte.
    pub position: u64,
    pub bytes: Vec<u8>,
    pub decoded: Decoded<'a>,
}

impl<'a> DisassembledInstruction<'a> {
    pub fn template(&self) -> Option<&'a Template> {
        match &self.decoded {
            Decoded::Instruction { template, .. } => Some(template),
            Decoded::InlineBytes => None,
        }
    }

    pub fn arguments(&self) -> &[Argument] {
        match &self.decoded {
            Decoded::Instruction { arguments, .. } => arguments,
            Decoded::InlineBytes => &[],
        }
    }

    pub fn is_inline_bytes(&self) -> bool {
        matches!(self.decoded, Decoded::InlineBytes)
    }

    /// Operand text without address and encoding.
    pub fn text(&self) -> String {
        match &self.decoded {
            Decoded::Instruction { template, arguments } => template.format(arguments, self.position),
            Decoded::InlineBytes if self.bytes.len() == 1 => format!(".byte {:#04x}", self.bytes[0]),
            Decoded::InlineBytes => {
                let items: Vec<String> = self.bytes.iter().map(|b| format!("{b:#04x}")).collect();
                format!(".bytes {}", items.join(", "))
            }
        }
    }
}

impl fmt::Display for DisassembledInstruction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}  {:<8}  {}", self.position, hex(&self.bytes), self.text())
    }
}

/// Decodes AArch64 code against a template catalog.
pub struct Disassembler<'a> {
    assembly: &'a Assembly,
    start_address: u64,
    preference: AbstractionPreference,
    expected_arguments: Option<usize>,
    inline_invalid_as_bytes: bool,
    inline_data: InlineDataDecoder,
}

impl<'a> Disassembler<'a> {
    pub fn new(assembly: &'a Assembly, start_address: u64) -> Self {
        Self {
            assembly,
            start_address,
            preference: AbstractionPreference::Synthetic,
            expected_arguments: None,
            inline_invalid_as_bytes: true,
            inline_data: InlineDataDecoder::default(),
        }
    }

    pub fn with_preference(mut self, preference: AbstractionPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Only consider templates taking exactly `count` operands.
    pub fn with_expected_arguments(mut self, count: Option<usize>) -> Self {
        self.expected_arguments = count;
        self
    }

    pub fn inline_invalid_as_bytes(mut self, enabled: bool) -> Self {
        self.inline_invalid_as_bytes = enabled;
        self
    }

    pub fn with_inline_data(mut self, decoder: InlineDataDecoder) -> Self {
        self.inline_data = decoder;
        self
    }

    fn skips(&self, template: &Template) -> bool {
        !template.disassemblable
            || (template.synthetic && self.preference == AbstractionPreference::Raw)
            || self.expected_arguments.is_some_and(|n| n != template.fields.len())
    }

    /// Every legal decoding of `word`, in group order.
    pub fn decode_word(&self, word: u32) -> Vec<(&'a Template, Vec<Argument>)> {
        let assembly = self.assembly;
        let mut matches = Vec::new();
        for group in assembly.specificity_groups() {
            for mask_group in group.mask_groups() {
                let opcode = word & mask_group.mask();
                for &serial in mask_group.templates_for(opcode) {
                    let template = assembly.template(serial);
                    if self.skips(template) {
                        continue;
                    }
                    let Some(arguments) = template
                        .fields
                        .iter()
                        .map(|field| field.decode(word))
                        .collect::<Option<Vec<_>>>()
                    else {
                        continue;
                    };
                    if !assembly.is_legal_argument_list(template, &arguments) {
                        continue;
                    }
                    match assembly.assemble(template, &arguments) {
                        Ok(encoded) if encoded == word => matches.push((template, arguments)),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(template = template.mnemonic, error = %e, "re-assembly failed during disassembly");
                        }
                    }
                }
            }
        }
        matches
    }

    fn select(
        &self,
        mut matches: Vec<(&'a Template, Vec<Argument>)>,
    ) -> Option<(&'a Template, Vec<Argument>)> {
        if matches.is_empty() {
            return None;
        }
        let index = match self.preference {
            AbstractionPreference::Synthetic => {
                matches.iter().position(|(t, _)| t.synthetic).unwrap_or(0)
            }
            AbstractionPreference::Raw => 0,
        };
        Some(matches.swap_remove(index))
    }

    /// Decode the instruction at `offset`. `Ok(None)` marks the end of the
    /// stream.
    pub fn scan_one_instruction(
        &self,
        code: &[u8],
        offset: usize,
    ) -> Result<Option<DisassembledInstruction<'a>>, DisassemblyError> {
        let position = self.start_address + offset as u64;
        let remaining = code.len().saturating_sub(offset);
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < INSTRUCTION_WIDTH {
            if !self.inline_invalid_as_bytes {
                return Ok(None);
            }
            return Ok(Some(DisassembledInstruction {
                position,
                bytes: code[offset..].to_vec(),
                decoded: Decoded::InlineBytes,
            }));
        }
        let bytes = &code[offset..offset + INSTRUCTION_WIDTH];
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        match self.select(self.decode_word(word)) {
            Some((template, arguments)) => Ok(Some(DisassembledInstruction {
                position,
                bytes: bytes.to_vec(),
                decoded: Decoded::Instruction { template, arguments },
            })),
            None if self.inline_invalid_as_bytes => Ok(Some(DisassembledInstruction {
                position,
                bytes: bytes.to_vec(),
                decoded: Decoded::InlineBytes,
            })),
            None => Err(DisassemblyError::NoMatch { position, hex: hex(bytes) }),
        }
    }

    /// Decode a whole code array, honouring recorded inline data.
    pub fn scan(&self, code: &[u8]) -> Result<Vec<DisassembledInstruction<'a>>, DisassemblyError> {
        let mut result = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            if let Some(descriptor) = self.inline_data.descriptor_at(offset as u32) {
                let position = self.start_address + offset as u64;
                if descriptor.tag != InlineDataTag::ByteData {
                    return Err(DisassemblyError::UnsupportedInlineData {
                        position,
                        kind: descriptor.tag.name(),
                    });
                }
                let end = (descriptor.end() as usize).min(code.len());
                for chunk_start in (offset..end).step_by(MAX_DATA_CHUNK) {
                    let chunk_end = (chunk_start + MAX_DATA_CHUNK).min(end);
                    result.push(DisassembledInstruction {
                        position: self.start_address + chunk_start as u64,
                        bytes: code[chunk_start..chunk_end].to_vec(),
                        decoded: Decoded::InlineBytes,
                    });
                }
                offset = end.max(offset + 1);
                continue;
            }
            match self.scan_one_instruction(code, offset)? {
                Some(instruction) => {
                    offset += instruction.bytes.len();
                    result.push(instruction);
                }
                None => break,
            }
        }
        Ok(result)
    }

    /// Disassembly text, one line per entry.
    pub fn render(&self, code: &[u8]) -> Result<String, DisassemblyError> {
        let mut out = String::new();
        for instruction in self.scan(code)? {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::aarch64::{AArch64Assembler, Insn, NOP, Reg};
    use crate::asm::codebuf::CodeBuffer;
    use crate::asm::inline_data::{InlineDataDescriptor, InlineDataRecorder};

    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_prefers_synthetic_alias() {
        let dis = Disassembler::new(Assembly::aarch64(), 0);
        // orr x1, xzr, x2
        let code = words(&[0xAA0203E1]);
        let instrs = dis.scan(&code).unwrap();
        assert_eq!(instrs[0].template().unwrap().mnemonic, "mov");
        assert_eq!(instrs[0].text(), "mov x1, x2");
    }

    #[test]
    fn test_raw_preference_skips_aliases() {
        let dis = Disassembler::new(Assembly::aarch64(), 0)
            .with_preference(AbstractionPreference::Raw);
        let instrs = dis.scan(&words(&[0xAA0203E1])).unwrap();
        assert_eq!(instrs[0].text(), "orr x1, xzr, x2");
    }

    #[test]
    fn test_expected_argument_count_filter() {
        let dis = Disassembler::new(Assembly::aarch64(), 0).with_expected_arguments(Some(3));
        let instrs = dis.scan(&words(&[0xAA0203E1])).unwrap();
        assert_eq!(instrs[0].template().unwrap().mnemonic, "orr");
    }

    #[test]
    fn test_unknown_word_as_bytes_or_error() {
        let code = words(&[0x00000000]);
        let dis = Disassembler::new(Assembly::aarch64(), 0x1000);
        let instrs = dis.scan(&code).unwrap();
        assert!(instrs[0].is_inline_bytes());
        assert_eq!(instrs[0].text(), ".bytes 0x00, 0x00, 0x00, 0x00");

        let strict = Disassembler::new(Assembly::aarch64(), 0x1000).inline_invalid_as_bytes(false);
        assert_eq!(
            strict.scan(&code),
            Err(DisassemblyError::NoMatch { position: 0x1000, hex: "00000000".to_string() })
        );
    }

    #[test]
    fn test_nv_condition_is_rejected() {
        // b.nv is not a legal decoding for the b.cond template
        let dis = Disassembler::new(Assembly::aarch64(), 0);
        let instrs = dis.scan(&words(&[0x5400000F])).unwrap();
        assert!(instrs[0].is_inline_bytes());
    }

    #[test]
    fn test_trailing_bytes() {
        let mut code = words(&[NOP]);
        code.extend_from_slice(&[1, 2]);
        let dis = Disassembler::new(Assembly::aarch64(), 0);
        let instrs = dis.scan(&code).unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[1].bytes, vec![1, 2]);

        let strict = Disassembler::new(Assembly::aarch64(), 0).inline_invalid_as_bytes(false);
        assert_eq!(strict.scan(&code).unwrap().len(), 1);
    }

    #[test]
    fn test_recorded_byte_data() {
        let mut recorder = InlineDataRecorder::new();
        recorder.record(InlineDataTag::ByteData, 4, 6);
        let code = [words(&[NOP]), vec![0xAA; 6], vec![0, 0], words(&[NOP])].concat();
        let dis = Disassembler::new(Assembly::aarch64(), 0)
            .with_inline_data(InlineDataDecoder::new(recorder.descriptors()));
        let instrs = dis.scan(&code).unwrap();
        assert_eq!(instrs[1].bytes.len(), 4);
        assert_eq!(instrs[2].bytes.len(), 2);
        assert_eq!(instrs[2].position, 8);
    }

    #[test]
    fn test_empty_data_run_keeps_instructions_aligned() {
        let descriptors = [InlineDataDescriptor { tag: InlineDataTag::ByteData, start: 0, size: 0 }];
        let dis = Disassembler::new(Assembly::aarch64(), 0).with_inline_data(InlineDataDecoder::new(&descriptors));
        let instrs = dis.scan(&words(&[NOP, NOP])).unwrap();
        assert_eq!(instrs.len(), 2);
        assert!(instrs.iter().all(|i| i.text() == "nop"));
        assert_eq!(instrs[1].position, 4);
    }

    #[test]
    fn test_jump_table_fails_loudly() {
        let mut recorder = InlineDataRecorder::new();
        recorder.record(InlineDataTag::JumpTable32, 0, 8);
        let dis = Disassembler::new(Assembly::aarch64(), 0)
            .with_inline_data(InlineDataDecoder::new(recorder.descriptors()));
        assert!(matches!(
            dis.scan(&[0; 8]),
            Err(DisassemblyError::UnsupportedInlineData { kind: "jump table", .. })
        ));
    }

    #[test]
    fn test_branch_targets_are_absolute() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        {
            let mut asm = AArch64Assembler::new(&mut buf);
            asm.b_cond(crate::asm::Cond::Ne, label);
            asm.nop();
        }
        buf.bind(label).unwrap();
        let code = buf.to_byte_array(Assembly::aarch64()).unwrap();
        let dis = Disassembler::new(Assembly::aarch64(), 0x4000);
        let instrs = dis.scan(&code).unwrap();
        assert_eq!(instrs[0].text(), "b.ne 0x4008");
    }

    #[test]
    fn test_memory_operand_syntax() {
        let mut buf = CodeBuffer::new();
        AArch64Assembler::new(&mut buf).stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16).unwrap();
        let dis = Disassembler::new(Assembly::aarch64(), 0);
        let instrs = dis.scan(buf.code()).unwrap();
        assert_eq!(instrs[0].template().unwrap().serial, Insn::StpPre as usize);
        assert_eq!(instrs[0].text(), "stp x29, x30, [sp, #-16]!");
    }
}

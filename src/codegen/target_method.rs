//! Compiled methods.
//!
//! A [`TargetMethod`] is created empty, filled by exactly one
//! [`TargetMethod::set_generated`] call and then only read. Positions are
//! byte offsets from the start of the method's code.

use super::CodegenError;
use crate::ir::bytecode::MethodKey;
use crate::ir::kind::ObjectRef;
use std::fmt::Write as _;
use std::sync::OnceLock;

/// Bit set in a direct-call stop position when the callee is a native
/// function.
pub const NATIVE_FUNCTION_CALL: u32 = 1 << 31;

/// Catch tables as parallel arrays. A handler position of 0 means the range
/// has no handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchTable {
    pub range_positions: Vec<u32>,
    pub block_positions: Vec<u32>,
}

impl CatchTable {
    pub const fn new() -> Self {
        Self { range_positions: Vec::new(), block_positions: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.range_positions.is_empty()
    }

    /// Ranges with the "no handler" sentinel made explicit.
    pub fn decode(&self) -> Vec<(u32, Option<u32>)> {
        self.range_positions
            .iter()
            .zip(&self.block_positions)
            .map(|(&range, &block)| (range, (block != 0).then_some(block)))
            .collect()
    }
}

/// Everything produced for one method, published in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generated {
    pub region: usize,
    /// Absolute address of the bundle.
    pub start: u64,
    /// Offset of the code within the bundle.
    pub code_offset: usize,
    pub frame_size: u32,
    pub scalar_literals: Vec<u8>,
    pub reference_literals: Vec<ObjectRef>,
    pub code: Vec<u8>,
    /// `[direct][indirect][safepoint]` positions.
    pub stop_positions: Vec<u32>,
    pub direct_callees: Vec<MethodKey>,
    pub indirect_calls: usize,
    pub safepoints: usize,
    pub frame_map_bytes: usize,
    pub register_map_bytes: usize,
    pub reference_maps: Vec<u8>,
    /// LEB128 bytecode position of each stop.
    pub frame_descriptors: Vec<u8>,
    pub catch_table: CatchTable,
    /// Encoded inline-data descriptors.
    pub inline_data: Vec<u8>,
}

static NOT_GENERATED: Generated = Generated {
    region: 0,
    start: 0,
    code_offset: 0,
    frame_size: 0,
    scalar_literals: Vec::new(),
    reference_literals: Vec::new(),
    code: Vec::new(),
    stop_positions: Vec::new(),
    direct_callees: Vec::new(),
    indirect_calls: 0,
    safepoints: 0,
    frame_map_bytes: 0,
    register_map_bytes: 0,
    reference_maps: Vec::new(),
    frame_descriptors: Vec::new(),
    catch_table: CatchTable::new(),
    inline_data: Vec::new(),
};

#[derive(Debug)]
pub struct TargetMethod {
    key: MethodKey,
    generated: OnceLock<Generated>,
}

impl TargetMethod {
    pub fn new(key: MethodKey) -> Self {
        Self { key, generated: OnceLock::new() }
    }

    pub fn key(&self) -> &MethodKey {
        &self.key
    }

    /// Publish the compiled code. Fails if called twice.
    pub fn set_generated(&self, generated: Generated) -> Result<(), CodegenError> {
        self.generated
            .set(generated)
            .map_err(|_| CodegenError::AlreadyGenerated(self.key.to_string()))
    }

    pub fn is_generated(&self) -> bool {
        self.generated.get().is_some()
    }

    fn g(&self) -> &Generated {
        self.generated.get().unwrap_or(&NOT_GENERATED)
    }

    pub fn region(&self) -> usize {
        self.g().region
    }

    pub fn start(&self) -> u64 {
        self.g().start
    }

    pub fn code_start(&self) -> u64 {
        self.g().start + self.g().code_offset as u64
    }

    pub fn code_end(&self) -> u64 {
        self.code_start() + self.g().code.len() as u64
    }

    /// Whether `address` falls inside this method's bundle.
    pub fn contains(&self, address: u64) -> bool {
        self.is_generated() && self.start() <= address && address < self.code_end()
    }

    pub fn frame_size(&self) -> u32 {
        self.g().frame_size
    }

    pub fn code(&self) -> &[u8] {
        &self.g().code
    }

    pub fn scalar_literals(&self) -> &[u8] {
        &self.g().scalar_literals
    }

    pub fn reference_literals(&self) -> &[ObjectRef] {
        &self.g().reference_literals
    }

    pub fn stop_positions(&self) -> &[u32] {
        &self.g().stop_positions
    }

    pub fn direct_calls(&self) -> usize {
        self.g().direct_callees.len()
    }

    pub fn indirect_calls(&self) -> usize {
        self.g().indirect_calls
    }

    pub fn safepoints(&self) -> usize {
        self.g().safepoints
    }

    pub fn direct_callees(&self) -> &[MethodKey] {
        &self.g().direct_callees
    }

    /// Code position of stop `index`, without call-kind bits.
    pub fn stop_position(&self, index: usize) -> Option<u32> {
        self.stop_positions().get(index).map(|p| p & !NATIVE_FUNCTION_CALL)
    }

    pub fn is_native_call(&self, index: usize) -> bool {
        index < self.direct_calls() && self.stop_positions()[index] & NATIVE_FUNCTION_CALL != 0
    }

    /// Index of the stop at `position`.
    pub fn stop_index_for(&self, position: u32) -> Option<usize> {
        (0..self.stop_positions().len()).find(|&i| self.stop_position(i) == Some(position))
    }

    pub fn catch_table(&self) -> &CatchTable {
        &self.g().catch_table
    }

    /// Handler entry for an exception raised at `throw_position`.
    pub fn catch_position_for(&self, throw_position: u32) -> Option<u32> {
        self.catch_table()
            .decode()
            .into_iter()
            .take_while(|&(range, _)| range <= throw_position)
            .last()
            .and_then(|(_, block)| block)
    }

    pub fn frame_map_bytes(&self) -> usize {
        self.g().frame_map_bytes
    }

    pub fn register_map_bytes(&self) -> usize {
        self.g().register_map_bytes
    }

    pub fn reference_maps(&self) -> &[u8] {
        &self.g().reference_maps
    }

    /// Frame reference map of stop `index`.
    pub fn frame_map(&self, index: usize) -> Option<&[u8]> {
        let size = self.frame_map_bytes();
        (index < self.stop_positions().len()).then(|| &self.reference_maps()[index * size..(index + 1) * size])
    }

    /// Register reference map of safepoint `index` (counted among
    /// safepoints only).
    pub fn register_map(&self, index: usize) -> Option<&[u8]> {
        if index >= self.safepoints() {
            return None;
        }
        let base = self.stop_positions().len() * self.frame_map_bytes();
        let size = self.register_map_bytes();
        Some(&self.reference_maps()[base + index * size..base + (index + 1) * size])
    }

    /// Bytecode position recorded for stop `index`.
    pub fn bytecode_position(&self, index: usize) -> Option<usize> {
        let mut bytes = self.g().frame_descriptors.as_slice();
        let mut current = 0;
        while !bytes.is_empty() {
            let (value, used) = read_leb128(bytes)?;
            if current == index {
                return Some(value as usize);
            }
            bytes = &bytes[used..];
            current += 1;
        }
        None
    }

    pub fn inline_data(&self) -> &[u8] {
        &self.g().inline_data
    }

    /// One line per stop listing the spill slots and registers holding
    /// references.
    pub fn reference_map_dump(&self, register_names: &[&str]) -> String {
        let mut out = String::new();
        let direct = self.direct_calls();
        let indirect = self.indirect_calls();
        for index in 0..self.stop_positions().len() {
            let kind = if index < direct {
                if self.is_native_call(index) { "native" } else { "direct" }
            } else if index < direct + indirect {
                "indirect"
            } else {
                "safepoint"
            };
            let position = self.stop_position(index).unwrap_or(0);
            let _ = write!(out, "stop {index} @ {position:#x} {kind}");
            if let Some(bci) = self.bytecode_position(index) {
                let _ = write!(out, " bci {bci}");
            }
            let slots: Vec<String> = self
                .frame_map(index)
                .map(set_bits)
                .unwrap_or_default()
                .into_iter()
                .map(|slot| format!("[sp, #{}]", slot * 8))
                .collect();
            let _ = write!(out, " frame {{{}}}", slots.join(", "));
            if index >= direct + indirect {
                let regs: Vec<String> = self
                    .register_map(index - direct - indirect)
                    .map(set_bits)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|bit| register_names.get(bit).map_or_else(|| format!("r{bit}"), |n| n.to_string()))
                    .collect();
                let _ = write!(out, " registers {{{}}}", regs.join(", "));
            }
            out.push('\n');
        }
        out
    }
}

fn set_bits(map: &[u8]) -> Vec<usize> {
    (0..map.len() * 8).filter(|&bit| map[bit / 8] & (1 << (bit % 8)) != 0).collect()
}

pub fn write_leb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode one value; returns it and the number of bytes read.
pub fn read_leb128(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate().take(10) {
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generated() -> Generated {
        let mut descriptors = Vec::new();
        for bci in [3u64, 200, 7] {
            write_leb128(bci, &mut descriptors);
        }
        Generated {
            start: 0x1000,
            code_offset: 16,
            code: vec![0; 64],
            stop_positions: vec![8 | NATIVE_FUNCTION_CALL, 20, 40],
            direct_callees: vec![MethodKey::new("T", "n", "()V")],
            indirect_calls: 1,
            safepoints: 1,
            frame_map_bytes: 1,
            register_map_bytes: 1,
            reference_maps: vec![0b01, 0b10, 0b00, 0b100],
            frame_descriptors: descriptors,
            catch_table: CatchTable { range_positions: vec![0, 16, 32], block_positions: vec![0, 48, 0] },
            ..Generated::default()
        }
    }

    #[test]
    fn test_set_generated_once() {
        let tm = TargetMethod::new(MethodKey::new("T", "m", "()V"));
        assert!(!tm.is_generated());
        assert_eq!(tm.code(), &[] as &[u8]);
        tm.set_generated(generated()).unwrap();
        assert!(matches!(tm.set_generated(generated()), Err(CodegenError::AlreadyGenerated(_))));
        assert_eq!(tm.code_start(), 0x1010);
        assert!(tm.contains(0x1000));
        assert!(!tm.contains(0x1050));
    }

    #[test]
    fn test_stop_lookup_strips_native_bit() {
        let tm = TargetMethod::new(MethodKey::new("T", "m", "()V"));
        tm.set_generated(generated()).unwrap();
        assert!(tm.is_native_call(0));
        assert!(!tm.is_native_call(1));
        assert_eq!(tm.stop_index_for(8), Some(0));
        assert_eq!(tm.stop_index_for(40), Some(2));
        assert_eq!(tm.stop_index_for(12), None);
        assert_eq!(tm.bytecode_position(1), Some(200));
    }

    #[test]
    fn test_catch_position_sentinel() {
        let tm = TargetMethod::new(MethodKey::new("T", "m", "()V"));
        tm.set_generated(generated()).unwrap();
        assert_eq!(tm.catch_position_for(4), None);
        assert_eq!(tm.catch_position_for(16), Some(48));
        assert_eq!(tm.catch_position_for(31), Some(48));
        assert_eq!(tm.catch_position_for(36), None);
        assert_eq!(tm.catch_table().decode()[0], (0, None));
    }

    #[test]
    fn test_reference_maps_and_dump() {
        let tm = TargetMethod::new(MethodKey::new("T", "m", "()V"));
        tm.set_generated(generated()).unwrap();
        assert_eq!(tm.frame_map(1), Some(&[0b10u8][..]));
        assert_eq!(tm.register_map(0), Some(&[0b100u8][..]));
        assert_eq!(tm.register_map(1), None);
        let dump = tm.reference_map_dump(&["x9", "x10", "x11"]);
        assert!(dump.contains("stop 0 @ 0x8 native bci 3 frame {[sp, #0]}"));
        assert!(dump.contains("stop 2 @ 0x28 safepoint bci 7 frame {} registers {x11}"));
    }

    #[test]
    fn test_leb128() {
        let mut out = Vec::new();
        write_leb128(300, &mut out);
        assert_eq!(out, vec![0xAC, 0x02]);
        assert_eq!(read_leb128(&out), Some((300, 2)));
    }
}

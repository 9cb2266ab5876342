//! Turns emitted code into an installed [`TargetMethod`].

use super::emitter::{EmittedCode, Emitter, Stop, StopKind};
use super::layout::{ArrayField, TargetBundleLayout};
use super::target_method::{CatchTable, Generated, NATIVE_FUNCTION_CALL, TargetMethod, write_leb128};
use super::CodegenError;
use crate::asm::{Assembly, Label};
use crate::code::CodeManager;
use crate::ir::bytecode::MethodKey;
use crate::ir::eir::{EirMethod, Literal, LiteralId};
use crate::ir::kind::ObjectRef;
use crate::regalloc::Allocation;
use crate::target::{LiteralError, Target};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Translator<'a> {
    target: &'a Target,
    manager: &'a CodeManager,
    building_boot_image: bool,
}

/// Literals in pool order.
struct LiteralPool {
    /// Scalar literal labels and their byte offsets, wide literals first.
    scalars: Vec<(Label, usize)>,
    scalar_bytes: Vec<u8>,
    references: Vec<(Label, ObjectRef)>,
}

impl<'a> Translator<'a> {
    pub fn new(target: &'a Target, manager: &'a CodeManager, building_boot_image: bool) -> Self {
        Self { target, manager, building_boot_image }
    }

    pub fn translate(&self, method: &EirMethod, alloc: &Allocation) -> Result<Arc<TargetMethod>, CodegenError> {
        let mut emitted = Emitter::new(method, alloc, self.target).emit()?;
        let pool = self.pack_literals(method, &emitted.literal_labels)?;
        let alignment = self.target.bundle_alignment;
        let reference_bytes = pool.references.len() * self.target.reference_size;

        // Provisional placement from a zero base.
        for &(label, offset) in &pool.scalars {
            emitted.buf.fix_label(label, offset as u64)?;
        }
        let provisional = pool.scalar_bytes.len().next_multiple_of(alignment);
        for (i, &(label, _)) in pool.references.iter().enumerate() {
            emitted.buf.fix_label(label, (provisional + i * self.target.reference_size) as u64)?;
        }

        let literal_layout = TargetBundleLayout::new(pool.scalar_bytes.len(), reference_bytes, 0, alignment);
        let scalar_base = literal_layout.first_element_offset(ArrayField::ScalarLiterals);
        let reference_base = literal_layout.first_element_offset(ArrayField::ReferenceLiterals);
        for &(label, offset) in &pool.scalars {
            emitted.buf.fix_label(label, (scalar_base + offset) as u64)?;
        }
        for (i, &(label, _)) in pool.references.iter().enumerate() {
            emitted.buf.fix_label(label, (reference_base + i * self.target.reference_size) as u64)?;
        }

        let code_offset = literal_layout.first_element_offset(ArrayField::Code);
        emitted.buf.set_start_address(code_offset as u64);
        let code = emitted.buf.to_byte_array(Assembly::aarch64())?;
        let layout = TargetBundleLayout::new(pool.scalar_bytes.len(), reference_bytes, code.len(), alignment);

        let stops = order_stops(&emitted.stops);
        let (stop_positions, direct_callees) = stop_positions(&stops);
        let catch_table = self.catch_table(method, &emitted)?;
        let (frame_map_bytes, register_map_bytes, reference_maps) = self.reference_maps(&emitted, &stops);
        let mut frame_descriptors = Vec::new();
        for stop in &stops {
            write_leb128(stop.bci as u64, &mut frame_descriptors);
        }

        let allocation = self.manager.allocate(layout.bundle_size(), alignment)?;
        let target_method = Arc::new(TargetMethod::new(method.key.clone()));
        target_method.set_generated(Generated {
            region: allocation.region,
            start: allocation.start,
            code_offset,
            frame_size: emitted.frame_size,
            scalar_literals: pool.scalar_bytes,
            reference_literals: pool.references.iter().map(|&(_, r)| r).collect(),
            code,
            stop_positions,
            direct_callees,
            indirect_calls: stops.iter().filter(|s| s.kind == StopKind::Indirect).count(),
            safepoints: stops.iter().filter(|s| s.kind == StopKind::Safepoint).count(),
            frame_map_bytes,
            register_map_bytes,
            reference_maps,
            frame_descriptors,
            catch_table,
            inline_data: emitted.inline_data.encode(),
        })?;

        let derived = TargetBundleLayout::from_target_method(&target_method, self.target.reference_size, alignment);
        if derived != layout || derived.bundle_size() != allocation.size {
            return Err(CodegenError::BundleSizeMismatch {
                method: method.key.to_string(),
                computed: allocation.size,
                derived: derived.bundle_size(),
            });
        }

        let bundle = bundle_bytes(&target_method, &layout, self.target.reference_size);
        debug!(
            method = %method.key,
            region = allocation.region,
            start = allocation.start,
            size = allocation.size,
            stops = target_method.stop_positions().len(),
            "installed target method"
        );
        self.manager.install(Arc::clone(&target_method), &bundle, !self.building_boot_image)?;
        Ok(target_method)
    }

    fn pack_literals(&self, method: &EirMethod, labels: &[(LiteralId, Label)]) -> Result<LiteralPool, CodegenError> {
        let mut scalars: Vec<(LiteralId, Label, usize)> = Vec::new();
        let mut references = Vec::new();
        for &(id, label) in labels {
            match &method.literals[id] {
                Literal::Scalar(value) => scalars.push((id, label, value.kind().width())),
                Literal::Reference(object) => references.push((label, *object)),
            }
        }
        // Stable, so literals of equal width keep their pool order.
        scalars.sort_by(|a, b| b.2.cmp(&a.2));

        let mut scalar_bytes = Vec::new();
        let mut placed = Vec::with_capacity(scalars.len());
        let mut offset = 0;
        for (id, label, width) in scalars {
            if scalar_bytes.len() != offset {
                return Err(LiteralError::Misplaced { index: offset, offset: scalar_bytes.len() }.into());
            }
            if let Literal::Scalar(value) = &method.literals[id] {
                self.target.data_model.write(value, &mut scalar_bytes)?;
            }
            placed.push((label, offset));
            offset += width;
        }
        if scalar_bytes.len() != offset {
            return Err(LiteralError::Misplaced { index: offset, offset: scalar_bytes.len() }.into());
        }
        Ok(LiteralPool { scalars: placed, scalar_bytes, references })
    }

    fn catch_table(&self, method: &EirMethod, emitted: &EmittedCode) -> Result<CatchTable, CodegenError> {
        let mut table = CatchTable::new();
        for &(range, handler) in &emitted.catch_ranges {
            let entry = match handler {
                Some(label) => {
                    let position = emitted.buf.label_position(label)?;
                    if position == 0 {
                        return Err(CodegenError::CatchAtZero { method: method.key.to_string() });
                    }
                    position
                }
                None => 0,
            };
            table.range_positions.push(range);
            table.block_positions.push(entry);
        }
        Ok(table)
    }

    /// Frame maps for every stop followed by register maps for every
    /// safepoint.
    fn reference_maps(&self, emitted: &EmittedCode, stops: &[&Stop]) -> (usize, usize, Vec<u8>) {
        let frame_map_bytes = (emitted.frame_slots as usize).div_ceil(8);
        let register_map_bytes = self.target.registers.register_map_bytes();
        let mut maps = Vec::new();
        for stop in stops {
            let mut map = vec![0u8; frame_map_bytes];
            for &slot in &stop.frame_refs {
                map[slot as usize / 8] |= 1 << (slot % 8);
            }
            maps.extend_from_slice(&map);
        }
        for stop in stops.iter().filter(|s| s.kind == StopKind::Safepoint) {
            let mut map = vec![0u8; register_map_bytes];
            for &index in &stop.register_refs {
                map[index / 8] |= 1 << (index % 8);
            }
            maps.extend_from_slice(&map);
        }
        (frame_map_bytes, register_map_bytes, maps)
    }
}

/// Direct calls, then indirect calls, then safepoints, each in emission
/// order.
fn order_stops(stops: &[Stop]) -> Vec<&Stop> {
    let rank = |stop: &Stop| match stop.kind {
        StopKind::Direct { .. } => 0,
        StopKind::Indirect => 1,
        StopKind::Safepoint => 2,
    };
    let mut ordered: Vec<&Stop> = stops.iter().collect();
    ordered.sort_by_key(|stop| rank(*stop));
    ordered
}

fn stop_positions(stops: &[&Stop]) -> (Vec<u32>, Vec<MethodKey>) {
    let mut positions: Vec<u32> = stops.iter().map(|s| s.position).collect();
    let index: HashMap<u32, usize> = positions.iter().enumerate().map(|(i, &p)| (p, i)).collect();
    let mut callees = Vec::new();
    for stop in stops {
        if let StopKind::Direct { callee, native } = &stop.kind {
            callees.push(callee.clone());
            if *native {
                if let Some(&i) = index.get(&stop.position) {
                    positions[i] |= NATIVE_FUNCTION_CALL;
                }
            }
        }
    }
    (positions, callees)
}

/// The bundle image: scalar literal bytes, reference handles and code, at
/// their layout offsets. Handles are stored little-endian in
/// `reference_size`-byte slots.
fn bundle_bytes(method: &TargetMethod, layout: &TargetBundleLayout, reference_size: usize) -> Vec<u8> {
    let mut bundle = vec![0u8; layout.bundle_size()];
    let scalars = layout.first_element_offset(ArrayField::ScalarLiterals);
    bundle[scalars..scalars + method.scalar_literals().len()].copy_from_slice(method.scalar_literals());
    let mut at = layout.first_element_offset(ArrayField::ReferenceLiterals);
    let width = reference_size.min(8);
    for object in method.reference_literals() {
        bundle[at..at + width].copy_from_slice(&object.0.to_le_bytes()[..width]);
        at += reference_size;
    }
    let code = layout.first_element_offset(ArrayField::Code);
    bundle[code..code + method.code().len()].copy_from_slice(method.code());
    bundle
}

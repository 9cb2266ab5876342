//! A bump-allocated code region with an address-ordered index.

use crate::codegen::TargetMethod;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A named address range registered with the memory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub start: u64,
    pub size: usize,
}

impl MemoryRegion {
    /// Whether `address` lies in `[start, start + size)`.
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.start + self.size as u64
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#x}, {:#x})", self.name, self.start, self.start + self.size as u64)
    }
}

/// A fixed window of the code cache holding many bundles.
#[derive(Debug)]
pub struct CodeRegion {
    /// 0 is the boot region; runtime regions count from 1.
    index: usize,
    name: String,
    start: u64,
    size: usize,
    top: usize,
    methods: BTreeMap<u64, Arc<TargetMethod>>,
}

impl CodeRegion {
    /// Create an empty region covering `size` bytes from `start`.
    pub fn new(index: usize, name: impl Into<String>, start: u64, size: usize) -> Self {
        Self { index, name: name.into(), start, size, top: 0, methods: BTreeMap::new() }
    }

    /// Position in the code manager's region list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name used in logs and the memory region list.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute address of the first byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.top
    }

    /// Whether `address` lies inside the region, used or not.
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.start + self.size as u64
    }

    /// Carve `size` bytes aligned to `alignment` from the free end. Returns
    /// the absolute address, or `None` if the region is full.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Option<u64> {
        // Align the bump pointer, then check the end still fits
        let offset = self.top.checked_next_multiple_of(alignment.max(1))?;
        let end = offset.checked_add(size)?;
        if end > self.size {
            return None;
        }
        self.top = end;
        Some(self.start + offset as u64)
    }

    /// Index an installed method by its bundle start.
    pub fn insert(&mut self, method: Arc<TargetMethod>) {
        self.methods.insert(method.start(), method);
    }

    /// The method whose bundle contains `address`.
    pub fn find(&self, address: u64) -> Option<Arc<TargetMethod>> {
        self.methods
            .range(..=address)
            .next_back()
            .filter(|(_, method)| method.contains(address))
            .map(|(_, method)| Arc::clone(method))
    }

    /// Installed methods in address order.
    pub fn methods(&self) -> impl Iterator<Item = &Arc<TargetMethod>> {
        self.methods.values()
    }

    /// The region as a registered memory range.
    pub fn memory_region(&self) -> MemoryRegion {
        MemoryRegion { name: self.name.clone(), start: self.start, size: self.size }
    }
}

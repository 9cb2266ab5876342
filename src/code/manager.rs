//! The code manager: region placement, lookup and call linking.
//!
//! The window is laid out as the boot region followed by `region_count`
//! runtime region slots of `region_size` bytes each. Runtime regions are
//! opened one at a time as the current region fills up.

use super::memory::CodeWindow;
use super::region::{CodeRegion, MemoryRegion};
use super::CodeCacheError;
use crate::asm::aarch64::encode_bl;
use crate::codegen::TargetMethod;
use crate::config::CodeCacheConfig;
use crate::ir::bytecode::MethodKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Reach of an AArch64 `bl` in either direction.
pub const BL_REACH: usize = 128 << 20;

/// Where a bundle was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeAllocation {
    pub region: usize,
    pub start: u64,
    pub size: usize,
}

#[derive(Debug)]
struct State {
    window: CodeWindow,
    boot: CodeRegion,
    runtime: Vec<CodeRegion>,
    runtime_start: u64,
    region_size: usize,
    region_count: usize,
    /// `None` while allocating in the boot region.
    current: Option<usize>,
    registered: Vec<MemoryRegion>,
    installed: Vec<Arc<TargetMethod>>,
    versions: HashMap<MethodKey, Vec<Arc<TargetMethod>>>,
    /// Absolute addresses of the `bl` instructions calling each method.
    call_sites: HashMap<MethodKey, Vec<u64>>,
    /// Installed but not yet linked, in boot-image mode.
    unlinked: Vec<Arc<TargetMethod>>,
}

#[derive(Debug)]
pub struct CodeManager {
    state: Mutex<State>,
}

impl CodeManager {
    /// Reserve the code window described by `config` and open the boot region.
    pub fn new(config: &CodeCacheConfig) -> Result<Self, CodeCacheError> {
        if config.region_size == 0 || config.boot_region_size == 0 {
            return Err(CodeCacheError::InvalidLayout("region sizes must be non-zero".into()));
        }
        if config.region_count > super::MAX_RUNTIME_REGIONS {
            return Err(CodeCacheError::InvalidLayout(format!(
                "{} runtime regions exceed the limit of {}",
                config.region_count,
                super::MAX_RUNTIME_REGIONS
            )));
        }
        // Boot region first, then every runtime region, all within `bl` reach
        let window_size = config
            .region_count
            .checked_mul(config.region_size)
            .and_then(|runtime| runtime.checked_add(config.boot_region_size))
            .ok_or_else(|| CodeCacheError::InvalidLayout("code window size overflows".into()))?;
        if window_size > BL_REACH {
            return Err(CodeCacheError::WindowOutOfReach { size: window_size, reach: BL_REACH });
        }
        // Runtime regions are carved out of the reservation lazily
        let window = CodeWindow::reserve(window_size)?;
        let base = window.base();
        let boot = CodeRegion::new(0, "boot", base, config.boot_region_size);
        let registered = vec![boot.memory_region()];
        debug!(base = %format!("{base:#x}"), size = window_size, "reserved code window");
        Ok(Self {
            state: Mutex::new(State {
                window,
                boot,
                runtime: Vec::new(),
                runtime_start: base + config.boot_region_size as u64,
                region_size: config.region_size,
                region_count: config.region_count,
                current: None,
                registered,
                installed: Vec::new(),
                versions: HashMap::new(),
                call_sites: HashMap::new(),
                unlinked: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, CodeCacheError> {
        self.state.lock().map_err(|_| CodeCacheError::Poisoned)
    }

    /// Place `size` bytes in the current region, opening a new region once
    /// if it is full.
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<CodeAllocation, CodeCacheError> {
        let mut state = self.lock()?;
        if let Some(allocation) = state.try_allocate(size, alignment) {
            return Ok(allocation);
        }
        let exhausted = |state: &State| CodeCacheError::Exhausted {
            size,
            region_size: state.region_size,
            regions: state.runtime.len(),
        };
        if !state.rotate() {
            return Err(exhausted(&*state));
        }
        match state.try_allocate(size, alignment) {
            Some(allocation) => Ok(allocation),
            None => Err(exhausted(&*state)),
        }
    }

    /// Add `region` to the registered memory regions.
    pub fn register_memory_region(&self, region: MemoryRegion) -> Result<(), CodeCacheError> {
        self.lock()?.register(region);
        Ok(())
    }

    /// Copy `bundle` to the method's placement and make it findable. With
    /// `link`, direct calls are patched now; otherwise they wait for
    /// [`CodeManager::link_all`].
    pub fn install(&self, method: Arc<TargetMethod>, bundle: &[u8], link: bool) -> Result<(), CodeCacheError> {
        if !method.is_generated() {
            return Err(CodeCacheError::NotGenerated(method.key().to_string()));
        }
        let mut state = self.lock()?;
        let offset = state.offset_of(method.start())?;
        state.window.write(offset, bundle)?;
        match state.region_mut(method.region()) {
            Some(region) => region.insert(Arc::clone(&method)),
            None => return Err(CodeCacheError::OutsideWindow(method.start())),
        }
        state.installed.push(Arc::clone(&method));
        state.versions.entry(method.key().clone()).or_default().push(Arc::clone(&method));
        if link {
            state.record_call_sites(&method);
            state.link_callers_of(method.key())?;
            state.link_callees_of(&method)?;
        } else {
            state.unlinked.push(method);
        }
        Ok(())
    }

    /// Link every method installed without linking. Returns the number of
    /// call sites patched.
    pub fn link_all(&self) -> Result<usize, CodeCacheError> {
        let mut state = self.lock()?;
        let unlinked = std::mem::take(&mut state.unlinked);
        for method in &unlinked {
            state.record_call_sites(method);
        }
        let keys: Vec<MethodKey> = state.call_sites.keys().cloned().collect();
        let mut patched = 0;
        for key in &keys {
            patched += state.link_callers_of(key)?;
        }
        let pending = state.pending_call_sites();
        info!(methods = unlinked.len(), patched, pending, "linked boot image");
        Ok(patched)
    }

    /// The method whose bundle contains `address`.
    pub fn code_pointer_to_target_method(&self, address: u64) -> Option<Arc<TargetMethod>> {
        let state = self.lock().ok()?;
        if state.boot.contains(address) {
            return state.boot.find(address);
        }
        let offset = address.checked_sub(state.runtime_start)?;
        let index = (offset / state.region_size as u64) as usize;
        state.runtime.get(index)?.find(address)
    }

    /// Every installed version of `key`, oldest first.
    pub fn method_key_to_target_methods(&self, key: &MethodKey) -> Vec<Arc<TargetMethod>> {
        self.lock()
            .ok()
            .and_then(|state| state.versions.get(key).cloned())
            .unwrap_or_default()
    }

    /// Every installed method, in installation order.
    pub fn target_methods(&self) -> Vec<Arc<TargetMethod>> {
        self.lock().map(|state| state.installed.clone()).unwrap_or_default()
    }

    /// Copy `len` bytes of installed code starting at `address`.
    pub fn read_code(&self, address: u64, len: usize) -> Result<Vec<u8>, CodeCacheError> {
        let state = self.lock()?;
        let offset = state.offset_of(address)?;
        Ok(state.window.read(offset, len)?)
    }

    /// Registered memory regions, boot region first.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.lock().map(|state| state.registered.clone()).unwrap_or_default()
    }

    /// Bytes allocated across all regions.
    pub fn total_size(&self) -> usize {
        self.lock()
            .map(|state| state.boot.used() + state.runtime.iter().map(CodeRegion::used).sum::<usize>())
            .unwrap_or(0)
    }

    /// Index of the region currently receiving allocations.
    pub fn current_region(&self) -> usize {
        self.lock().ok().and_then(|state| state.current.map(|i| i + 1)).unwrap_or(0)
    }

    /// Call sites whose callee has no installed version.
    pub fn pending_call_sites(&self) -> usize {
        self.lock().map(|state| state.pending_call_sites()).unwrap_or(0)
    }
}

impl State {
    fn current_region(&mut self) -> &mut CodeRegion {
        match self.current {
            Some(i) => &mut self.runtime[i],
            None => &mut self.boot,
        }
    }

    fn region_mut(&mut self, index: usize) -> Option<&mut CodeRegion> {
        match index {
            0 => Some(&mut self.boot),
            i => self.runtime.get_mut(i - 1),
        }
    }

    fn try_allocate(&mut self, size: usize, alignment: usize) -> Option<CodeAllocation> {
        let region = self.current_region();
        let start = region.allocate(size, alignment)?;
        Some(CodeAllocation { region: region.index(), start, size })
    }

    /// Open the next runtime region. Fails if every slot is in use.
    fn rotate(&mut self) -> bool {
        let slot = self.runtime.len();
        if slot >= self.region_count {
            return false;
        }
        let start = self.runtime_start + (slot * self.region_size) as u64;
        let region = CodeRegion::new(slot + 1, format!("runtime-{slot}"), start, self.region_size);
        self.register(region.memory_region());
        self.runtime.push(region);
        self.current = Some(slot);
        info!(region = slot + 1, start = %format!("{start:#x}"), "opened code region");
        true
    }

    fn register(&mut self, region: MemoryRegion) {
        if !self.registered.contains(&region) {
            self.registered.push(region);
        }
    }

    fn offset_of(&self, address: u64) -> Result<usize, CodeCacheError> {
        address
            .checked_sub(self.window.base())
            .map(|offset| offset as usize)
            .filter(|&offset| offset < self.window.size())
            .ok_or(CodeCacheError::OutsideWindow(address))
    }

    fn record_call_sites(&mut self, method: &Arc<TargetMethod>) {
        for (index, callee) in method.direct_callees().iter().enumerate() {
            if method.is_native_call(index) {
                continue;
            }
            let Some(position) = method.stop_position(index) else { continue };
            self.call_sites
                .entry(callee.clone())
                .or_default()
                .push(method.code_start() + position as u64);
        }
    }

    /// Point every known call to `key` at its newest version.
    fn link_callers_of(&mut self, key: &MethodKey) -> Result<usize, CodeCacheError> {
        let Some(target) = self.versions.get(key).and_then(|v| v.last()).map(|m| m.code_start()) else {
            return Ok(0);
        };
        let sites = self.call_sites.get(key).cloned().unwrap_or_default();
        for &address in &sites {
            self.patch(address, target)?;
        }
        Ok(sites.len())
    }

    /// Link the calls made by a freshly installed method.
    fn link_callees_of(&mut self, method: &Arc<TargetMethod>) -> Result<(), CodeCacheError> {
        for (index, callee) in method.direct_callees().iter().enumerate() {
            if method.is_native_call(index) {
                continue;
            }
            let (Some(position), Some(target)) = (
                method.stop_position(index),
                self.versions.get(callee).and_then(|v| v.last()).map(|m| m.code_start()),
            ) else {
                continue;
            };
            self.patch(method.code_start() + position as u64, target)?;
        }
        Ok(())
    }

    fn patch(&mut self, address: u64, target: u64) -> Result<(), CodeCacheError> {
        let word = encode_bl(address, target)?;
        let offset = self.offset_of(address)?;
        self.window.write_u32(offset, word)?;
        Ok(())
    }

    fn pending_call_sites(&self) -> usize {
        self.call_sites
            .iter()
            .filter(|(key, _)| !self.versions.contains_key(*key))
            .map(|(_, sites)| sites.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Generated;

    fn config(region_size: usize, region_count: usize) -> CodeCacheConfig {
        CodeCacheConfig { region_size, region_count, boot_region_size: region_size }
    }

    fn generated_at(manager: &CodeManager, name: &str, code: Vec<u8>, callees: &[&str]) -> Arc<TargetMethod> {
        let allocation = manager.allocate(code.len(), 8).unwrap();
        let method = Arc::new(TargetMethod::new(MethodKey::new("T", name, "()V")));
        let stop_positions = (0..callees.len() as u32).map(|i| i * 4).collect();
        method
            .set_generated(Generated {
                region: allocation.region,
                start: allocation.start,
                code,
                stop_positions,
                direct_callees: callees.iter().map(|c| MethodKey::new("T", c, "()V")).collect(),
                ..Generated::default()
            })
            .unwrap();
        method
    }

    fn word_at(manager: &CodeManager, address: u64) -> u32 {
        let bytes = manager.read_code(address, 4).unwrap();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_window_beyond_reach_is_rejected() {
        let err = CodeManager::new(&config(4 << 20, 40)).unwrap_err();
        assert!(matches!(err, CodeCacheError::WindowOutOfReach { .. }));
        assert!(matches!(CodeManager::new(&config(4096, 65)), Err(CodeCacheError::InvalidLayout(_))));
    }

    #[test]
    fn test_rotation_and_lookup() {
        let manager = CodeManager::new(&config(4096, 2)).unwrap();
        let a = manager.allocate(3000, 8).unwrap();
        assert_eq!(a.region, 0);
        let b = manager.allocate(3000, 8).unwrap();
        assert_eq!(b.region, 1);
        assert_eq!(manager.current_region(), 1);
        assert_eq!(manager.regions().len(), 2);
        let c = manager.allocate(3000, 8).unwrap();
        assert_eq!(c.region, 2);
        assert!(matches!(manager.allocate(3000, 8), Err(CodeCacheError::Exhausted { .. })));
        assert!(matches!(manager.allocate(5000, 8), Err(CodeCacheError::Exhausted { .. })));
        assert_eq!(manager.total_size(), 9000);
    }

    #[test]
    fn test_callers_are_linked_when_callee_arrives() {
        let manager = CodeManager::new(&config(4096, 2)).unwrap();
        let caller = generated_at(&manager, "caller", vec![0; 8], &["callee"]);
        manager.install(Arc::clone(&caller), &[0; 8], true).unwrap();
        assert_eq!(manager.pending_call_sites(), 1);

        let callee = generated_at(&manager, "callee", vec![0; 4], &[]);
        manager.install(Arc::clone(&callee), &[0; 4], true).unwrap();
        assert_eq!(manager.pending_call_sites(), 0);
        let expected = encode_bl(caller.code_start(), callee.code_start()).unwrap();
        assert_eq!(word_at(&manager, caller.code_start()), expected);

        let newer = generated_at(&manager, "callee", vec![0; 4], &[]);
        manager.install(Arc::clone(&newer), &[0; 4], true).unwrap();
        let relinked = encode_bl(caller.code_start(), newer.code_start()).unwrap();
        assert_eq!(word_at(&manager, caller.code_start()), relinked);
        assert_eq!(manager.method_key_to_target_methods(newer.key()).len(), 2);
    }

    #[test]
    fn test_boot_image_defers_linking() {
        let manager = CodeManager::new(&config(4096, 1)).unwrap();
        let caller = generated_at(&manager, "caller", vec![0; 8], &["callee"]);
        let callee = generated_at(&manager, "callee", vec![0; 4], &[]);
        manager.install(Arc::clone(&caller), &[0; 8], false).unwrap();
        manager.install(Arc::clone(&callee), &[0; 4], false).unwrap();
        assert_eq!(word_at(&manager, caller.code_start()), 0);
        assert_eq!(manager.link_all().unwrap(), 1);
        let expected = encode_bl(caller.code_start(), callee.code_start()).unwrap();
        assert_eq!(word_at(&manager, caller.code_start()), expected);
    }

    #[test]
    fn test_lookup_misses_outside_code() {
        let manager = CodeManager::new(&config(4096, 1)).unwrap();
        let method = generated_at(&manager, "m", vec![0; 16], &[]);
        manager.install(Arc::clone(&method), &[0; 16], true).unwrap();
        assert!(manager.code_pointer_to_target_method(method.start() + 8).is_some());
        assert!(manager.code_pointer_to_target_method(method.code_end()).is_none());
        assert!(manager.code_pointer_to_target_method(0).is_none());
    }
}

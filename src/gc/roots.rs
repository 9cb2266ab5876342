//! Code roots: the reference literal slots of installed methods.

use super::marking_stack::{MarkingStack, MarkingStackError};
use crate::code::CodeManager;
use crate::codegen::{ArrayField, TargetBundleLayout};
use crate::target::Target;
use tracing::debug;

/// Push the address of every reference literal slot of every installed
/// method. Returns the number of cells pushed.
pub fn scan_code_roots(manager: &CodeManager, target: &Target, stack: &mut MarkingStack) -> Result<usize, MarkingStackError> {
    let mut pushed = 0;
    let methods = manager.target_methods();
    for method in &methods {
        let layout = TargetBundleLayout::from_target_method(method, target.reference_size, target.bundle_alignment);
        let base = method.start() + layout.first_element_offset(ArrayField::ReferenceLiterals) as u64;
        for i in 0..method.reference_literals().len() {
            stack.push(base + (i * target.reference_size) as u64)?;
            pushed += 1;
        }
    }
    debug!(methods = methods.len(), cells = pushed, "scanned code roots");
    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Generated;
    use crate::codegen::TargetMethod;
    use crate::config::CodeCacheConfig;
    use crate::gc::marking_stack::{Cell, CellVisitor};
    use crate::ir::bytecode::MethodKey;
    use crate::ir::kind::ObjectRef;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<Cell>>>);

    impl CellVisitor for Collect {
        fn visit_popped_cell(&mut self, _: &mut MarkingStack, cell: Cell) -> Result<(), MarkingStackError> {
            self.0.lock().unwrap().push(cell);
            Ok(())
        }

        fn visit_flushed_cell(&mut self, cell: Cell) {
            self.0.lock().unwrap().push(cell);
        }
    }

    #[test]
    fn test_reference_slots_are_pushed() {
        let manager = CodeManager::new(&CodeCacheConfig::default()).unwrap();
        let target = Target::aarch64();
        let allocation = manager.allocate(32, 8).unwrap();
        let method = Arc::new(TargetMethod::new(MethodKey::new("T", "m", "()V")));
        method
            .set_generated(Generated {
                region: allocation.region,
                start: allocation.start,
                code_offset: 24,
                scalar_literals: vec![0; 4],
                reference_literals: vec![ObjectRef(1), ObjectRef(2)],
                code: vec![0; 8],
                ..Generated::default()
            })
            .unwrap();
        manager.install(Arc::clone(&method), &[0; 32], true).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut stack = MarkingStack::new(64, 75).unwrap();
        stack.set_cell_visitor(Box::new(Collect(Arc::clone(&seen))));
        assert_eq!(scan_code_roots(&manager, &target, &mut stack).unwrap(), 2);
        stack.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![method.start() + 16, method.start() + 8]);
    }
}

//! Placement of compiled methods across the boot and runtime regions.

use cpsjit::code::CodeCacheError;
use cpsjit::ir::bytecode::NoMethods;
use cpsjit::{CompileError, Compiler, CompilerConfig, Program};
use std::sync::Arc;

fn constant_methods(count: usize) -> Program {
    let methods: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{ "key": {{ "holder": "Gen", "name": "m{i}", "descriptor": "()J" }},
                     "code": [{{ "l_const": {} }}, "return_value"] }}"#,
                0x1_0000_0000_i64 + i as i64
            )
        })
        .collect();
    Program::from_json(&format!("[{}]", methods.join(","))).unwrap()
}

fn small_cache(regions: usize) -> Compiler {
    let mut config = CompilerConfig::default();
    config.code_cache.boot_region_size = 256;
    config.code_cache.region_size = 256;
    config.code_cache.region_count = regions;
    config.compiler.workers = 1;
    Compiler::new(config).unwrap()
}

#[test]
fn test_methods_spill_into_runtime_regions() {
    let program = constant_methods(24);
    let compiler = small_cache(8);
    let methods = compiler.compile_all(&program).unwrap();

    let manager = compiler.code_manager();
    assert!(manager.current_region() >= 1);
    assert!(methods.iter().any(|m| m.region() == 0));
    assert!(methods.iter().any(|m| m.region() > 0));

    let regions = manager.regions();
    assert_eq!(regions[0].name, "boot");
    assert_eq!(regions.len(), manager.current_region() + 1);
    for method in &methods {
        let region = &regions[method.region()];
        assert!(region.contains(method.start()), "{} not in {region}", method.key());
        let found = manager.code_pointer_to_target_method(method.code_start()).unwrap();
        assert!(Arc::ptr_eq(&found, method));
    }
}

#[test]
fn test_regions_are_contiguous_slots() {
    let program = constant_methods(24);
    let compiler = small_cache(8);
    compiler.compile_all(&program).unwrap();
    let regions = compiler.code_manager().regions();
    for pair in regions.windows(2) {
        assert_eq!(pair[0].start + pair[0].size as u64, pair[1].start);
    }
}

#[test]
fn test_exhausted_cache_is_fatal() {
    let program = constant_methods(64);
    let compiler = small_cache(1);
    let err = compiler.compile_all(&program).unwrap_err();
    assert!(matches!(err, CompileError::CodeCache(CodeCacheError::Exhausted { regions: 1, .. })), "{err}");
    assert!(err.is_fatal());
}

#[test]
fn test_oversized_window_is_rejected() {
    let mut config = CompilerConfig::default();
    config.code_cache.region_size = 8 << 20;
    config.code_cache.region_count = 16;
    assert!(Compiler::new(config).is_err());
}

#[test]
fn test_lookup_outside_any_method_misses() {
    let program = constant_methods(1);
    let compiler = small_cache(2);
    let methods = compiler.compile_all(&program).unwrap();
    let manager = compiler.code_manager();
    assert!(manager.code_pointer_to_target_method(methods[0].code_end()).is_none());
    assert!(manager.code_pointer_to_target_method(0).is_none());
}

//! End-to-end compilation through the public API: bytecode in, installed
//! bundles out.

use cpsjit::asm::aarch64::encode_bl;
use cpsjit::gc::MarkingStack;
use cpsjit::gc::roots::scan_code_roots;
use cpsjit::ir::bytecode::NoMethods;
use cpsjit::{Compiler, CompilerConfig, Program};

fn compiler() -> Compiler {
    let mut config = CompilerConfig::default();
    config.code_cache.region_count = 4;
    config.compiler.inline = false;
    config.compiler.workers = 1;
    Compiler::new(config).unwrap()
}

fn program(json: &str) -> Program {
    Program::from_json(json).unwrap()
}

const LOOP: &str = r#"[{
    "key": { "holder": "Demo", "name": "sum", "descriptor": "(I)I" },
    "locals": ["int"],
    "code": [
        { "i_const": 0 },
        { "store": 1 },
        { "load": 0 },
        { "if": { "cond": "le", "target": 13 } },
        { "load": 1 },
        { "load": 0 },
        "i_add",
        { "store": 1 },
        { "load": 0 },
        { "i_const": -1 },
        "i_add",
        { "store": 0 },
        { "goto": 2 },
        { "load": 1 },
        "return_value"
    ]
}]"#;

#[test]
fn test_backward_branch_gets_a_safepoint() {
    let program = program(LOOP);
    let compiler = compiler();
    let sum = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    assert!(sum.safepoints() >= 1);
    assert_eq!(sum.direct_calls(), 0);

    let text = compiler.disassemble(&sum).unwrap();
    assert!(text.contains("ldr"), "{text}");
    assert!(text.contains("ret"), "{text}");

    let dump = sum.reference_map_dump(&["x9", "x10", "x11", "x12", "x13", "x14", "x15"]);
    assert_eq!(dump.lines().count(), sum.stop_positions().len());
    assert!(dump.lines().all(|line| line.contains("safepoint")), "{dump}");
}

#[test]
fn test_call_inside_try_range_maps_to_handler() {
    let program = program(
        r#"[{
            "key": { "holder": "Demo", "name": "guarded", "descriptor": "()I" },
            "code": [
                { "invoke_static": { "holder": "Demo", "name": "risky", "descriptor": "()V" } },
                { "i_const": 1 },
                "return_value",
                "pop",
                { "i_const": 2 },
                "return_value"
            ],
            "handlers": [{ "start": 0, "end": 1, "handler": 3 }]
        }]"#,
    );
    let compiler = compiler();
    let guarded = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    assert_eq!(guarded.direct_calls(), 1);
    assert!(!guarded.catch_table().is_empty());

    let call = guarded.stop_position(0).unwrap();
    let handler = guarded.catch_position_for(call).unwrap();
    assert!(handler > call);
    assert!((handler as usize) < guarded.code().len());
    assert_eq!(compiler.code_manager().pending_call_sites(), 1);
}

#[test]
fn test_reference_literal_survives_call_as_root() {
    let program = program(
        r#"[{
            "key": { "holder": "Demo", "name": "keep", "descriptor": "()Ljava/lang/Object;" },
            "code": [
                { "ldc": 43981 },
                { "invoke_static": { "holder": "Demo", "name": "tick", "descriptor": "()V" } },
                "return_value"
            ]
        }]"#,
    );
    let compiler = compiler();
    let keep = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    assert_eq!(keep.reference_literals().len(), 1);
    assert_eq!(keep.reference_literals()[0].0, 43981);

    let frame = keep.frame_map(0).unwrap();
    assert!(frame.iter().any(|&b| b != 0), "live reference must be in a spill slot");

    let mut stack = MarkingStack::new(64, 75).unwrap();
    let pushed = scan_code_roots(compiler.code_manager(), compiler.target(), &mut stack).unwrap();
    assert!(pushed >= 1);
    assert_eq!(stack.len(), pushed);
}

#[test]
fn test_recompiled_callee_is_relinked() {
    let program = program(
        r#"[
            {
                "key": { "holder": "Demo", "name": "one", "descriptor": "()I" },
                "code": [{ "i_const": 1 }, "return_value"]
            },
            {
                "key": { "holder": "Demo", "name": "caller", "descriptor": "()I" },
                "code": [
                    { "invoke_static": { "holder": "Demo", "name": "one", "descriptor": "()I" } },
                    "return_value"
                ]
            }
        ]"#,
    );
    let compiler = compiler();
    let first = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    let caller = compiler.compile(&program.methods[1], &NoMethods).unwrap();
    let site = caller.code_start() + caller.stop_position(0).unwrap() as u64;
    let word = |c: &Compiler| c.code_manager().read_code(site, 4).unwrap();
    assert_eq!(word(&compiler), encode_bl(site, first.code_start()).unwrap().to_le_bytes());

    let second = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    assert_ne!(first.code_start(), second.code_start());
    assert_eq!(word(&compiler), encode_bl(site, second.code_start()).unwrap().to_le_bytes());

    let versions = compiler.code_manager().method_key_to_target_methods(&program.methods[0].key);
    assert_eq!(versions.len(), 2);
    assert_eq!(compiler.code_manager().pending_call_sites(), 0);
}

#[test]
fn test_unknown_jump_target_is_an_input_error() {
    let program = program(
        r#"[{
            "key": { "holder": "Demo", "name": "bad", "descriptor": "()V" },
            "code": [{ "goto": 9 }]
        }]"#,
    );
    let err = compiler().compile(&program.methods[0], &NoMethods).unwrap_err();
    assert!(!err.is_fatal(), "{err}");
}

fn safepoint_method(name: &str, after: &str) -> String {
    format!(
        r#"[{{
            "key": {{ "holder": "Demo", "name": "{name}", "descriptor": "()Ljava/lang/Object;" }},
            "locals": ["reference"],
            "code": [{{ "ldc": 77 }}, {{ "store": 0 }}, "safepoint", {after}, "return_value"]
        }}]"#
    )
}

fn set_bits(map: &[u8]) -> usize {
    map.iter().map(|b| b.count_ones() as usize).sum()
}

#[test]
fn test_safepoint_register_map_marks_live_reference() {
    let program = program(&safepoint_method("live", r#"{ "load": 0 }"#));
    let compiler = compiler();
    let live = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    assert_eq!(live.safepoints(), 1);

    let index = live.stop_positions().len() - 1;
    let registers = live.register_map(0).unwrap();
    assert_eq!(set_bits(registers), 1, "{registers:?}");
    assert_eq!(set_bits(live.frame_map(index).unwrap()), 0);

    let names = ["x9", "x10", "x11", "x12", "x13", "x14", "x15"];
    let dump = live.reference_map_dump(&names);
    let line = dump.lines().last().unwrap();
    assert!(line.contains("safepoint"), "{dump}");
    assert!(names.iter().any(|n| line.contains(&format!("registers {{{n}}}"))), "{dump}");
}

#[test]
fn test_safepoint_register_map_skips_dead_reference() {
    let program = program(&safepoint_method("dead", r#""a_const_null""#));
    let compiler = compiler();
    let dead = compiler.compile(&program.methods[0], &NoMethods).unwrap();
    assert_eq!(dead.safepoints(), 1);

    let index = dead.stop_positions().len() - 1;
    assert!(dead.register_map(0).unwrap().iter().all(|&b| b == 0));
    assert!(dead.frame_map(index).unwrap().iter().all(|&b| b == 0));
}

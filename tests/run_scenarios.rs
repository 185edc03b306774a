//! End-to-end scenarios driven through the same code paths as the `wavm`
//! binary.

use std::io::Write;
use std::path::PathBuf;
use wavm::commands::run::{execute, Run, PRECOMPILED_SECTION_NAME};
use wavm_runtime_core::{
    error::{RuntimeError, Trap},
    features::FeatureSpec,
    invoke::catch_runtime_exceptions,
};

fn write_fixture(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}

fn run_options(path: PathBuf) -> Run {
    Run {
        function: None,
        precompiled: false,
        enable: vec![],
        abi: None,
        mount_root: None,
        wasi_trace: None,
        path,
        args: vec![],
    }
}

#[test]
fn bare_add_returns_its_result_as_the_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(
        &dir,
        "add.wast",
        br#"(module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
    );

    let mut options = run_options(path);
    options.function = Some("add".to_string());
    options.args = vec!["2".to_string(), "3".to_string()];
    assert_eq!(execute(&options), 5);
}

#[test]
fn binary_and_text_forms_load_identically() {
    let dir = tempfile::tempdir().unwrap();
    let wat = br#"(module
        (func (export "answer") (result i32) i32.const 42))"#;
    let wasm = wabt::wat2wasm(&wat[..]).unwrap();

    let text_path = write_fixture(&dir, "answer.wast", wat);
    let binary_path = write_fixture(&dir, "answer.wasm", &wasm);

    for path in [text_path, binary_path].iter() {
        let mut options = run_options(path.clone());
        options.function = Some("answer".to_string());
        assert_eq!(execute(&options), 42);
    }
}

#[test]
fn a_divide_trap_is_a_runtime_exception() {
    // The binary's policy for an unhandled runtime exception is a fatal
    // abort; here the same exception is caught at the boundary and its
    // message inspected.
    let message = catch_runtime_exceptions(
        || -> Result<String, RuntimeError> {
            Err(RuntimeError::Trap(Trap::IntegerDivideByZeroOrOverflow))
        },
        |exception| format!("Runtime exception: {}", exception),
    );
    assert_eq!(
        message,
        "Runtime exception: integer divide by zero or integer overflow"
    );
}

#[test]
fn missing_imports_fail_the_link() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(
        &dir,
        "needs-import.wast",
        br#"(module
            (import "env" "external" (func $external))
            (func (export "main")
                call $external))"#,
    );

    // A bare module has no resolver for env.external: exit code 1.
    let options = run_options(path);
    assert_eq!(execute(&options), 1);
}

#[test]
fn wasi_hello_writes_to_stdout_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(
        &dir,
        "hello.wast",
        br#"(module
            (import "wasi_unstable" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (import "wasi_unstable" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "hello\n")
            (func (export "_start")
                i32.const 0
                i32.const 16
                i32.store
                i32.const 4
                i32.const 6
                i32.store
                i32.const 1
                i32.const 0
                i32.const 1
                i32.const 24
                call $fd_write
                drop
                i32.const 0
                call $proc_exit))"#,
    );

    assert_eq!(execute(&run_options(path)), 0);
}

#[test]
fn a_wasi_module_without_a_memory_export_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(
        &dir,
        "no-memory.wast",
        br#"(module
            (import "wasi_unstable" "proc_exit" (func $proc_exit (param i32)))
            (func (export "_start")
                i32.const 0
                call $proc_exit))"#,
    );
    assert_eq!(execute(&run_options(path)), 1);
}

fn leb128(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return out;
        }
    }
}

/// Appends a custom section to a binary module.
fn append_custom_section(mut wasm: Vec<u8>, name: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&leb128(name.len() as u32));
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(payload);

    wasm.push(0); // custom section id
    wasm.extend_from_slice(&leb128(body.len() as u32));
    wasm.extend_from_slice(&body);
    wasm
}

#[test]
fn precompiled_modules_round_trip_through_the_object_section() {
    let dir = tempfile::tempdir().unwrap();
    let wat = br#"(module
        (func (export "answer") (result i32) i32.const 42))"#;
    let wasm = wabt::wat2wasm(&wat[..]).unwrap();

    let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
    let object = module
        .inner()
        .runnable_module
        .serialize_object(module.info())
        .unwrap();

    let precompiled = append_custom_section(wasm, PRECOMPILED_SECTION_NAME, &object);
    let path = write_fixture(&dir, "answer.precompiled.wasm", &precompiled);

    let mut options = run_options(path);
    options.precompiled = true;
    options.function = Some("answer".to_string());
    assert_eq!(execute(&options), 42);
}

#[test]
fn a_missing_precompiled_section_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let wasm = wabt::wat2wasm(r#"(module (func (export "f")))"#).unwrap();
    let path = write_fixture(&dir, "plain.wasm", &wasm);

    let mut options = run_options(path);
    options.precompiled = true;
    assert_eq!(execute(&options), 1);
}

#[test]
fn a_precompiled_section_from_another_backend_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let wasm = wabt::wat2wasm(r#"(module (func (export "f")))"#).unwrap();

    let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
    let mut object = module
        .inner()
        .runnable_module
        .serialize_object(module.info())
        .unwrap();
    // Corrupt the code key: the object now claims another toolchain.
    object[0] ^= 0xFF;

    let precompiled = append_custom_section(wasm, PRECOMPILED_SECTION_NAME, &object);
    let path = write_fixture(&dir, "stale.precompiled.wasm", &precompiled);

    let mut options = run_options(path);
    options.precompiled = true;
    assert_eq!(execute(&options), 1);
}

#[test]
fn reserialized_modules_keep_their_export_table() {
    let wasm = wabt::wat2wasm(
        r#"(module
            (memory (export "memory") 1)
            (global (export "answer") i32 (i32.const 42))
            (func (export "main") (result i32) i32.const 0)
            (table (export "table") 1 funcref))"#,
    )
    .unwrap();

    let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
    let object = module
        .inner()
        .runnable_module
        .serialize_object(module.info())
        .unwrap();
    let reloaded = unsafe {
        wavm_runtime_core::load_object_with(&object, &wavm_interp_backend::InterpCompiler::new())
    }
    .unwrap();

    assert_eq!(module.info().exports, reloaded.info().exports);
}

#[test]
fn unknown_features_and_abis_are_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(&dir, "empty.wast", br#"(module)"#);

    let mut options = run_options(path.clone());
    options.enable = vec!["no-such-feature".to_string()];
    assert_eq!(execute(&options), 1);

    let mut options = run_options(path);
    options.abi = Some("sysv".to_string());
    assert_eq!(execute(&options), 1);
}

//! Command-line behavior of the `abcvm` binary.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use abcvm::abc::writer::{self, CodeBuilder, ProgramBuilder};
use abcvm::abc::Opcode;

fn abcvm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_abcvm"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run abcvm")
}

fn write_hello(dir: &Path) -> String {
    let mut b = ProgramBuilder::new();
    let trace = b.qname("", "trace");
    let hello = b.string("hello from a file");
    let mut c = CodeBuilder::new();
    c.get_local(0)
        .op(Opcode::PushScope)
        .op_u30(Opcode::FindPropStrict, trace)
        .op_u30(Opcode::PushString, hello)
        .op_u30_u30(Opcode::CallPropVoid, trace, 1)
        .op(Opcode::ReturnVoid);
    let init = b.method(0, 3, 1, c.finish());
    b.script(init, Vec::new());
    let path = dir.join("hello.abc");
    fs::write(&path, writer::encode(&b.finish())).unwrap();
    path.display().to_string()
}

#[test]
fn test_run_prints_trace_output() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_hello(dir.path());
    for mode in ["off", "on", "auto"] {
        let out = abcvm(&["run", &file, "--jit", mode]);
        assert!(out.status.success(), "{}: {}", mode, String::from_utf8_lossy(&out.stderr));
        assert_eq!(String::from_utf8_lossy(&out.stdout), "hello from a file\n");
    }
}

#[test]
fn test_run_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_hello(dir.path());
    let config = dir.path().join("abcvm.toml");
    fs::write(&config, "jit_mode = \"off\"\nstack_slack = 4\n").unwrap();
    let out = abcvm(&["run", &file, "--config", &config.display().to_string()]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello from a file\n");
}

#[test]
fn test_dump_json() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_hello(dir.path());
    let out = abcvm(&["dump", &file, "--json"]);
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["scripts"].as_array().map(Vec::len), Some(1));
}

#[test]
fn test_dump_listing_names_opcodes() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_hello(dir.path());
    let out = abcvm(&["dump", &file]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("callpropvoid"), "{}", text);
}

#[test]
fn test_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.abc");
    let out = abcvm(&["run", &missing.display().to_string()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("error:"));
}

#[test]
fn test_truncated_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.abc");
    fs::write(&path, [0x10, 0x00]).unwrap();
    let out = abcvm(&["dump", &path.display().to_string()]);
    assert!(!out.status.success());
}

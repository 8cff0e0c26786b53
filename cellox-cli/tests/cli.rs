//! End-to-end tests driving the `cellox` binary directly, checking the
//! exit codes and stdout/stderr promised by spec §6/§7.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

#[test]
fn running_a_source_file_prints_to_stdout_and_exits_ok() {
    Command::cargo_bin("cellox")
        .unwrap()
        .arg(fixture("hello.clx"))
        .assert()
        .success()
        .stdout(predicate::str::contains("hello, world"));
}

#[test]
fn a_syntax_error_exits_with_the_compile_error_code() {
    Command::cargo_bin("cellox")
        .unwrap()
        .arg(fixture("syntax_error.clx"))
        .assert()
        .code(65)
        .stderr(predicate::str::contains("Unterminated string"));
}

#[test]
fn a_runtime_type_error_exits_with_the_runtime_error_code() {
    Command::cargo_bin("cellox")
        .unwrap()
        .arg(fixture("runtime_error.clx"))
        .assert()
        .code(70);
}

#[test]
fn an_unrecognized_suffix_exits_with_the_usage_error_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.txt");
    std::fs::write(&path, "print 1;").unwrap();

    Command::cargo_bin("cellox").unwrap().arg(&path).assert().code(64);
}

#[test]
fn a_missing_file_exits_with_the_io_error_code() {
    Command::cargo_bin("cellox")
        .unwrap()
        .arg("tests/fixtures/does_not_exist.clx")
        .assert()
        .code(74);
}

#[test]
fn compile_then_run_round_trips_through_a_chunk_file() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("hello.clx");
    std::fs::copy(fixture("hello.clx"), &source_path).unwrap();

    Command::cargo_bin("cellox")
        .unwrap()
        .args(["-c", source_path.to_str().unwrap()])
        .assert()
        .success();

    let chunk_path = dir.path().join("hello.cxcf");
    assert!(chunk_path.exists(), "compile should have written {}", chunk_path.display());

    Command::cargo_bin("cellox")
        .unwrap()
        .arg(&chunk_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello, world"));
}

#[test]
fn compile_rejects_a_non_source_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.cxcf");
    std::fs::write(&path, b"not a real chunk file").unwrap();

    Command::cargo_bin("cellox")
        .unwrap()
        .args(["-c", path.to_str().unwrap()])
        .assert()
        .code(64);
}

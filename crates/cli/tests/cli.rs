//! CLI integration tests: run the built binary against real files and
//! check exit codes and streams.

use std::io::Write;
use std::process::{Command, Stdio};

fn lox() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lox"))
}

fn write_script(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp script");
    file.write_all(contents.as_bytes()).expect("write script");
    file
}

#[test]
fn runs_a_script_and_exits_zero() {
    let script = write_script("print 1 + 2 * 3;");
    let output = lox().arg(script.path()).output().expect("run lox");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "7\n");
    assert!(output.stderr.is_empty());
}

#[test]
fn compile_error_exits_65() {
    let script = write_script("var x");
    let output = lox().arg(script.path()).output().expect("run lox");
    assert_eq!(output.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Expect ';' after variable declaration."));
}

#[test]
fn runtime_error_exits_70() {
    let script = write_script("-nil;");
    let output = lox().arg(script.path()).output().expect("run lox");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Operand must be a number."));
    assert!(stderr.contains("in script"));
}

#[test]
fn missing_file_exits_74() {
    let output = lox()
        .arg("definitely/not/a/real/path.lox")
        .output()
        .expect("run lox");
    assert_eq!(output.status.code(), Some(74));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Could not open file"));
}

#[test]
fn reads_program_from_stdin_with_dash() {
    let mut child = lox()
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn lox");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"print \"from stdin\";")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "from stdin\n");
}

#[test]
fn version_flag_prints_version() {
    let output = lox().arg("--version").output().expect("run lox");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn dump_flag_disassembles_to_stderr() {
    let script = write_script("print 1;");
    let output = lox()
        .arg("--dump")
        .arg(script.path())
        .output()
        .expect("run lox");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "1\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("== <script> =="));
    assert!(stderr.contains("OP_PRINT"));
}

#[test]
fn stress_and_log_gc_flags_work_together() {
    let script = write_script(
        "var s=\"\";for(var i=0;i<5;i=i+1){s=s+\"x\";}print s;",
    );
    let output = lox()
        .arg("--stress-gc")
        .arg("--log-gc")
        .arg(script.path())
        .output()
        .expect("run lox");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "xxxxx\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("-- gc begin"));
}

#[test]
fn demo_scripts_run_clean() {
    let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|p| p.parent())
        .map(|p| p.join("demos"))
        .expect("demos directory");
    for entry in std::fs::read_dir(&demos).expect("read demos") {
        let path = entry.expect("dir entry").path();
        if path.extension().is_some_and(|e| e == "lox") {
            let output = lox().arg(&path).output().expect("run demo");
            assert_eq!(
                output.status.code(),
                Some(0),
                "demo {:?} failed: {}",
                path,
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }
}

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Test context with an isolated working directory and a stripped
/// environment so no host Qt installation leaks into the run.
struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    fn deploy_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_crossdeployqt");
        let mut cmd = Command::new(bin_path);
        cmd.current_dir(self.temp_dir.path());
        // An empty PATH guarantees every external helper probe fails, so
        // tool-dependent behavior is deterministic regardless of the host.
        cmd.env("PATH", "");
        cmd.env_remove("QTPATHS_BIN");
        cmd.env_remove("QML_ROOT");
        cmd.env_remove("QML2_IMPORT_PATH");
        cmd
    }

    fn write_elf_stub(&self, name: &str) -> PathBuf {
        let path = self.path().join(name);
        let mut bytes = vec![0x7F, b'E', b'L', b'F', 2, 1, 1, 0];
        bytes.resize(64, 0);
        std::fs::write(&path, bytes).expect("failed to write stub binary");
        path
    }
}

#[test]
fn help_shows_usage() {
    let ctx = TestContext::new();
    let output = ctx
        .deploy_cmd()
        .arg("--help")
        .output()
        .expect("failed to run crossdeployqt");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("--bin"));
    assert!(stdout.contains("--out"));
}

#[test]
fn version_succeeds() {
    let ctx = TestContext::new();
    let output = ctx
        .deploy_cmd()
        .arg("--version")
        .output()
        .expect("failed to run crossdeployqt");
    assert!(output.status.success());
}

#[test]
fn missing_required_arguments_exit_2() {
    let ctx = TestContext::new();
    let output = ctx
        .deploy_cmd()
        .output()
        .expect("failed to run crossdeployqt");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn nonexistent_binary_exits_2() {
    let ctx = TestContext::new();
    let output = ctx
        .deploy_cmd()
        .args(["--bin", "no/such/app", "--out", "dist"])
        .output()
        .expect("failed to run crossdeployqt");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn undetectable_format_exits_2() {
    let ctx = TestContext::new();
    let plain = ctx.path().join("notes.txt");
    std::fs::write(&plain, b"just some text, long enough to read").unwrap();
    let output = ctx
        .deploy_cmd()
        .arg("--bin")
        .arg(&plain)
        .args(["--out", "dist"])
        .output()
        .expect("failed to run crossdeployqt");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown binary format"));
}

#[test]
fn truncated_fat_macho_exits_2() {
    let ctx = TestContext::new();
    let path = ctx.path().join("fat");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    bytes.extend_from_slice(&5u32.to_be_bytes());
    bytes.resize(40, 0);
    std::fs::write(&path, bytes).unwrap();

    let output = ctx
        .deploy_cmd()
        .arg("--bin")
        .arg(&path)
        .args(["--out", "dist"])
        .output()
        .expect("failed to run crossdeployqt");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("fat header larger than file"));
}

#[test]
fn detected_format_is_reported_before_tool_check() {
    let ctx = TestContext::new();
    let binary = ctx.write_elf_stub("app");
    let output = ctx
        .deploy_cmd()
        .arg("--bin")
        .arg(&binary)
        .args(["--out", "dist"])
        .output()
        .expect("failed to run crossdeployqt");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Detected: ELF"));
}

#[test]
fn missing_tools_exit_2_and_are_named() {
    let ctx = TestContext::new();
    let binary = ctx.write_elf_stub("app");
    let output = ctx
        .deploy_cmd()
        .arg("--bin")
        .arg(&binary)
        .args(["--out", "dist"])
        .output()
        .expect("failed to run crossdeployqt");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing required tools"));
    for tool in ["qtpaths", "qmlimportscanner", "lconvert", "objdump", "patchelf"] {
        assert!(stderr.contains(tool), "missing {tool} in: {stderr}");
    }
}

//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("meadow");
    cmd.env_remove("MEADOW_PORT")
        .env_remove("MEADOW_BAUD")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("meadow"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("meadow"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_every_command() {
    let assert = cli_cmd()
        .arg("--help")
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for command in [
        "list-ports",
        "dfu-list",
        "info",
        "files",
        "upload",
        "delete",
        "trace",
        "trace-host",
        "runtime",
        "restart",
        "enter-dfu",
        "listen",
    ] {
        assert!(stdout.contains(command), "help is missing {command}");
    }
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn list_ports_with_device_check_reports_device_info() {
    let output = cli_cmd()
        .args(["--timeout-ms", "100", "list-ports", "--probe", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    let ports = parsed
        .as_array()
        .expect("should be a JSON array");
    assert!(ports.iter().all(|p| p.get("device_info").is_some()));
}

#[test]
fn upload_missing_file_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir
        .path()
        .join("App.dll");

    cli_cmd()
        .arg("upload")
        .arg(missing.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error").and(predicate::str::contains("not found")));
}

#[test]
fn command_on_missing_port_fails() {
    let output = cli_cmd()
        .args(["--port", "INVALID_PORT_NAME_XYZ", "info", "--json"])
        .output()
        .expect("command should execute");

    assert!(!output.status.success(), "missing port should not succeed");
    assert!(output.stdout.is_empty(), "stdout should stay clean");
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));
}

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_esp_address() {
    cli_cmd()
        .args(["upload", "fw.bin", "--esp", "0xnothex"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("hex"));
}

#[test]
fn exit_code_two_for_invalid_toggle() {
    cli_cmd()
        .args(["trace-host", "maybe"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_flag_suggests_similar() {
    cli_cmd()
        .arg("list-ports")
        .arg("--jason")
        .assert()
        .failure()
        .stderr(predicate::str::contains("json"));
}

#[test]
fn invalid_local_config_warns_but_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("meadow.toml"), "invalid toml [[[").expect("write invalid config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");

    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

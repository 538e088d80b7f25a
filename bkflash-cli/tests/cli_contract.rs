//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("bkflash");
    cmd.env_remove("BKFLASH_PORT")
        .env_remove("BKFLASH_BAUD")
        .env_remove("BKFLASH_RESET")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bkflash"))
        .stdout(predicate::str::contains("download"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bkflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_options() {
    cli_cmd()
        .args(["download", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bin"))
        .stdout(predicate::str::contains("--erase-all"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_download_without_bin() {
    cli_cmd()
        .arg("download")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_malformed_bin_argument() {
    cli_cmd()
        .args(["download", "--bin", "app.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("file:address"));
}

#[test]
fn exit_code_two_for_invalid_reset() {
    cli_cmd()
        .args(["--reset", "7", "list-ports"])
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_erase_without_target() {
    cli_cmd()
        .args(["--non-interactive", "erase"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--all"));
}

#[test]
fn exit_code_two_for_completions_without_shell() {
    cli_cmd()
        .arg("completions")
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_baud_above_boot_rom_limit() {
    let dir = tempdir().expect("tempdir should be created");
    let app = dir.path().join("app.bin");
    fs::write(&app, [0u8; 16]).expect("write app.bin");

    cli_cmd()
        .args(["--baud", "9000000", "-p", "/dev/null-bkflash", "download", "--bin"])
        .arg(format!("{}:0x0", app.display()))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("baud"));
}

#[test]
fn exit_code_two_for_overlapping_segments() {
    let dir = tempdir().expect("tempdir should be created");
    let app = dir.path().join("app.bin");
    fs::write(&app, [0u8; 0x2000]).expect("write app.bin");

    cli_cmd()
        .args(["-p", "/dev/null-bkflash", "download"])
        .arg("--bin")
        .arg(format!("{}:0x0", app.display()))
        .arg("--bin")
        .arg(format!("{}:0x1000", app.display()))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("overlap"));
}

#[test]
fn exit_code_one_for_missing_binary() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("missing.bin");

    cli_cmd()
        .args(["-p", "/dev/null-bkflash", "download", "--bin"])
        .arg(format!("{}:0x0", missing.display()))
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn unopenable_port_reports_link_failure_as_json() {
    let dir = tempdir().expect("tempdir should be created");
    let app = dir.path().join("app.bin");
    fs::write(&app, [0u8; 16]).expect("write app.bin");
    let port = dir.path().join("no-such-port");

    let output = cli_cmd()
        .arg("-p")
        .arg(&port)
        .args(["download", "--json", "--bin"])
        .arg(format!("{}:0x0", app.display()))
        .output()
        .expect("command should execute");

    assert_eq!(output.status.code(), Some(1));
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    let summaries = parsed.as_array().expect("JSON array");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["passed"], false);
    assert_eq!(summaries[0]["stage"], "link");
}

// ============================================================================
// Output Tests
// ============================================================================

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bkflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_is_a_json_array() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert!(parsed.is_array());
}

#[test]
fn non_interactive_environment_variable_works() {
    cli_cmd()
        .env("BKFLASH_NON_INTERACTIVE", "true")
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("downlaod")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("download"));
}

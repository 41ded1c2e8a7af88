//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the hieravg binary
fn hieravg_cmd() -> Command {
    let mut cmd = Command::cargo_bin("hieravg").unwrap();
    cmd.env_remove("HIERAVG_CONFIG");
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    hieravg_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hieravg"))
        .stdout(predicate::str::contains("root"))
        .stdout(predicate::str::contains("relay"))
        .stdout(predicate::str::contains("leaf"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    hieravg_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hieravg"))
        .stdout(predicate::str::contains("Build Information"))
        .stdout(predicate::str::contains("Git Hash"))
        .stdout(predicate::str::contains("Target"));
}

#[test]
fn test_short_version_flag() {
    hieravg_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hieravg"));
}

#[test]
fn test_relay_help_lists_parent_flags() {
    hieravg_cmd()
        .args(["relay", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--parent-host"))
        .stdout(predicate::str::contains("--parent-port"));
}

// ─────────────────────────────────────────────────────────────────
// Config Command Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_default() {
    hieravg_cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[node]"))
        .stdout(predicate::str::contains("[schedule]"))
        .stdout(predicate::str::contains("[relay]"))
        .stdout(predicate::str::contains("[leaf]"))
        .stdout(predicate::str::contains("[logging]"));
}

#[test]
fn test_config_validate_default() {
    hieravg_cmd()
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_nonexistent_file() {
    hieravg_cmd()
        .args(["config", "validate", "--config", "/nonexistent/path/node.toml"])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("not found").or(predicate::str::contains("Error")));
}

#[test]
fn test_config_init_and_force() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("node.toml");
    let path_str = path.to_str().unwrap();

    hieravg_cmd()
        .args(["config", "init", "--path", path_str])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration file created"));
    assert!(path.exists());

    // Refuses to overwrite without --force
    hieravg_cmd()
        .args(["config", "init", "--path", path_str])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    hieravg_cmd()
        .args(["config", "init", "--path", path_str, "--force"])
        .assert()
        .success();

    // The generated file is itself a valid configuration
    hieravg_cmd()
        .args(["config", "validate", "--config", path_str])
        .assert()
        .success();
}

// ─────────────────────────────────────────────────────────────────
// Argument Errors
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_malformed_port_is_usage_error() {
    hieravg_cmd()
        .args(["root", "--port", "notaport"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_unknown_subcommand() {
    hieravg_cmd()
        .arg("frobnicate")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_leaf_connection_refused() {
    // Grab a free port and release it so nothing is listening there
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    hieravg_cmd()
        .args(["-q", "leaf", "--server-host", "127.0.0.1", "--server-port"])
        .arg(port.to_string())
        .assert()
        .failure()
        .code(30)
        .stderr(predicate::str::contains("E300"));
}

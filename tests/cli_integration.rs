//! Integration tests for CLI commands.
//!
//! These tests verify that CLI commands work correctly without
//! requiring a running message bus. Every test points `--config` at a
//! temporary file so the user's configuration is never touched.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command for the dbus-controller binary
fn dbus_controller() -> Command {
    Command::cargo_bin("dbus-controller").unwrap()
}

fn config_in(dir: &TempDir) -> String {
    dir.path().join("config.toml").display().to_string()
}

#[test]
fn test_help_command() {
    dbus_controller()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("REST API server for D-Bus"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("buses"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    dbus_controller()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dbus-controller"));
}

#[test]
fn test_serve_help() {
    dbus_controller()
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--bind"));
}

#[test]
fn test_config_show_creates_default() {
    let dir = TempDir::new().unwrap();
    let path = config_in(&dir);

    dbus_controller()
        .args(["--config", &path, "config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[server]"))
        .stdout(predicate::str::contains("127.0.0.1:8080"))
        .stdout(predicate::str::contains("[[buses]]"));

    assert!(dir.path().join("config.toml").exists());
}

#[test]
fn test_config_without_show() {
    let dir = TempDir::new().unwrap();
    dbus_controller()
        .args(["--config", &config_in(&dir), "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--show"));
}

#[test]
fn test_buses_lists_defaults() {
    let dir = TempDir::new().unwrap();
    dbus_controller()
        .args(["--config", &config_in(&dir), "buses"])
        .assert()
        .success()
        .stdout(predicate::str::contains("system"))
        .stdout(predicate::str::contains("session"));
}

#[test]
fn test_buses_lists_custom_bus() {
    let dir = TempDir::new().unwrap();
    let path = config_in(&dir);
    fs::write(
        &path,
        r#"
[[buses]]
id = "dev"
kind = "custom"
description = "Development bus"
address = "unix:path=/tmp/dev-bus"
"#,
    )
    .unwrap();

    dbus_controller()
        .args(["--config", &path, "buses"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dev"))
        .stdout(predicate::str::contains("custom"))
        .stdout(predicate::str::contains("unix:path=/tmp/dev-bus"))
        .stdout(predicate::str::contains("session").not());
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = config_in(&dir);
    fs::write(&path, "[dbus]\nmax_in_flight = 0\n").unwrap();

    dbus_controller()
        .args(["--config", &path, "buses"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_malformed_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = config_in(&dir);
    fs::write(&path, "[server\n").unwrap();

    dbus_controller()
        .args(["--config", &path, "config", "--show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config"));
}

#[test]
fn test_serve_rejects_bad_bind() {
    let dir = TempDir::new().unwrap();
    dbus_controller()
        .args(["--config", &config_in(&dir), "serve", "--bind", "not-an-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid API bind address"));
}

#[test]
fn test_unknown_command() {
    dbus_controller()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

//! CLI integration tests for downlodr
//!
//! Tests the downlodr CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const HELLO_WAT: &str = r#"(module
  (import "downlodr" "call" (func $call (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{\"method\":\"ui.registerMenuItem\",\"params\":{\"label\":\"Hello\",\"context\":\"main\"}}")
  (func (export "initialize") (result i32)
    (drop (call $call (i32.const 16) (i32.const 76) (i32.const 0)))
    (i32.const 0)))"#;

/// Helper to create a command isolated inside `home`
#[allow(deprecated)]
fn downlodr_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("downlodr").unwrap();
    cmd.env("DOWNLODR_APP_DATA", home.path().join("app"));
    cmd.env("DOWNLODR_CONFIG_DIR", home.path().join("config"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_package(parent: &Path, id: &str, version: &str) -> PathBuf {
    let dir = parent.join(format!("{id}-{version}"));
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        format!(r#"{{"id":"{id}","name":"Demo","version":"{version}","main":"index.wasm"}}"#),
    )
    .unwrap();
    fs::write(dir.join("index.wasm"), HELLO_WAT).unwrap();
    dir
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    downlodr_cmd(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plugins"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_list_empty() {
    let home = TempDir::new().unwrap();
    downlodr_cmd(&home)
        .args(["plugins", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins installed."));
}

#[test]
fn test_install_list_and_reinstall() {
    let home = TempDir::new().unwrap();
    let package = write_package(home.path(), "p1", "1.0.0");

    downlodr_cmd(&home)
        .args(["plugins", "install"])
        .arg(&package)
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed p1 1.0.0"));

    downlodr_cmd(&home)
        .args(["plugins", "install"])
        .arg(&package)
        .assert()
        .success()
        .stdout(predicate::str::contains("already installed"));

    let output = downlodr_cmd(&home)
        .args(["plugins", "list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let plugins: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plugins[0]["id"], "p1");
    assert_eq!(plugins[0]["enabled"], true);
}

#[test]
fn test_run_shows_contributed_items() {
    let home = TempDir::new().unwrap();
    let package = write_package(home.path(), "p1", "1.0.0");
    downlodr_cmd(&home)
        .args(["plugins", "install"])
        .arg(&package)
        .assert()
        .success();

    let output = downlodr_cmd(&home)
        .args(["run", "--context", "main", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["items"][0]["label"], "Hello");
    assert_eq!(report["items"][0]["pluginId"], "p1");

    downlodr_cmd(&home)
        .args(["plugins", "disable", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Disabled p1"));

    downlodr_cmd(&home)
        .args(["run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No items contributed."));
}

#[test]
fn test_uninstall_removes_directory() {
    let home = TempDir::new().unwrap();
    let package = write_package(home.path(), "p1", "1.0.0");
    downlodr_cmd(&home)
        .args(["plugins", "install"])
        .arg(&package)
        .assert()
        .success();

    downlodr_cmd(&home)
        .args(["plugins", "uninstall", "p1"])
        .assert()
        .success();
    assert!(!home.path().join("app/plugins/p1").exists());

    downlodr_cmd(&home)
        .args(["plugins", "uninstall", "p1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not installed"));
}

#[test]
fn test_validate_rejects_missing_entry() {
    let home = TempDir::new().unwrap();
    let dir = home.path().join("broken");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        r#"{"id":"broken","name":"Broken","version":"1.0.0"}"#,
    )
    .unwrap();

    downlodr_cmd(&home)
        .args(["plugins", "validate"])
        .arg(&dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("E501"));

    fs::write(dir.join("index.wasm"), HELLO_WAT).unwrap();
    downlodr_cmd(&home)
        .args(["plugins", "validate"])
        .arg(&dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid plugin package"));
}

#[test]
fn test_location_of_installed_plugin() {
    let home = TempDir::new().unwrap();
    let package = write_package(home.path(), "p1", "1.0.0");
    downlodr_cmd(&home)
        .args(["plugins", "install"])
        .arg(&package)
        .assert()
        .success();

    downlodr_cmd(&home)
        .args(["plugins", "location", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plugins"));
}

#[test]
fn test_config_set_and_get() {
    let home = TempDir::new().unwrap();

    downlodr_cmd(&home)
        .args(["config", "set", "sandbox.fuel_limit", "1000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set sandbox.fuel_limit = 1000"));

    downlodr_cmd(&home)
        .args(["config", "get", "sandbox.fuel_limit"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1000"));

    downlodr_cmd(&home)
        .args(["config", "set", "sandbox.fuel_limit", "0"])
        .assert()
        .failure();

    downlodr_cmd(&home)
        .args(["config", "get", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}

#[test]
fn test_run_respects_auto_load_off() {
    let home = TempDir::new().unwrap();
    let package = write_package(home.path(), "p1", "1.0.0");
    downlodr_cmd(&home)
        .args(["plugins", "install"])
        .arg(&package)
        .assert()
        .success();

    downlodr_cmd(&home)
        .args(["config", "set", "plugins.auto_load", "false"])
        .assert()
        .success();

    downlodr_cmd(&home)
        .args(["run", "--context", "main"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plugins.auto_load = false"))
        .stdout(predicate::str::contains("No items contributed."));

    let output = downlodr_cmd(&home)
        .args(["run", "--format", "json"])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["autoLoad"], false);
    assert!(report["items"].as_array().unwrap().is_empty());
}

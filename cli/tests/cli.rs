//! End-to-end tests for the `hostguard` binary against a configuration
//! rooted in a temporary directory. Nothing here needs root.
//!
//! ## Exit Codes
//! - 0: Success
//! - 1: Operational failure
//! - 2: Usage error

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};

use anyhow::Result;
use hostguard_core::config::GuardConfig;
use predicates::prelude::*;
use serde_json::Value as JsonValue;
use tempfile::TempDir;

/// Write a rooted configuration and return its path.
fn write_config(dir: &Path) -> PathBuf {
    let mut config = GuardConfig::rooted_at(dir);
    config.control.cooldown_secs = 0;
    config.unlock.cooldown_secs = 0;
    let path = dir.join("config.toml");
    std::fs::write(&path, config.to_toml().unwrap()).unwrap();
    path
}

fn hostguard(config: &Path) -> Result<assert_cmd::Command> {
    let mut cmd = assert_cmd::Command::cargo_bin("hostguard")?;
    cmd.env_remove("HOSTGUARD_CONFIG");
    cmd.env("RUST_LOG", "warn");
    cmd.arg("--config").arg(config);
    Ok(cmd)
}

#[test]
fn help_lists_commands() -> Result<()> {
    assert_cmd::Command::cargo_bin("hostguard")?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("setup"))
        .stdout(predicate::str::contains("unlock"))
        .stdout(predicate::str::contains("control"));
    Ok(())
}

#[test]
fn conflicting_snapshot_flags_are_a_usage_error() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    hostguard(&config)?
        .args(["setup", "--force-snapshot", "--no-snapshot", "--dry-run"])
        .assert()
        .code(2);
    Ok(())
}

#[test]
fn blank_unlock_reason_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    hostguard(&config)?
        .args(["unlock", "--reason", "   "])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("reason is required"));
    Ok(())
}

#[test]
fn setup_dry_run_prints_plan_and_writes_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n")?;

    hostguard(&config)?
        .args(["setup", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would take canonical snapshot"))
        .stdout(predicate::str::contains("hostguard-watchdog.service"))
        .stdout(predicate::str::contains("hostguard-pre.hook"))
        .stdout(predicate::str::contains("reconcile and apply protections"));

    assert!(!dir.path().join("state").exists());
    assert!(!dir.path().join("systemd").exists());
    Ok(())
}

#[test]
fn control_show_defaults_to_enabled() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    hostguard(&config)?
        .args(["control", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ENABLED"));
    Ok(())
}

#[test]
fn control_disable_needs_the_phrase() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());

    hostguard(&config)?
        .args(["control", "disable", "--reason", "router swap"])
        .write_stdin("no\n")
        .assert()
        .code(1);
    hostguard(&config)?
        .args(["control", "show"])
        .assert()
        .stdout(predicate::str::contains("ENABLED"));

    hostguard(&config)?
        .args(["control", "disable", "--reason", "router swap"])
        .write_stdin("I accept losing the guard\n")
        .assert()
        .success();
    hostguard(&config)?
        .args(["control", "show"])
        .assert()
        .stdout(predicate::str::contains("DISABLED"));

    let audit = std::fs::read_to_string(dir.path().join("audit.log"))?;
    assert!(audit.contains("control_disable_refused"));
    assert!(audit.contains("to=DISABLED"));
    Ok(())
}

#[test]
fn status_json_reports_uninitialised_guard() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    let output = hostguard(&config)?.args(["status", "--json"]).output()?;
    assert!(output.status.success());

    let status: JsonValue = serde_json::from_slice(&output.stdout)?;
    assert_eq!(status["control"], "ENABLED");
    assert_eq!(status["canonical_present"], false);
    assert_eq!(status["in_sync"], false);
    assert_eq!(
        status["resource"],
        dir.path().join("hosts").display().to_string()
    );
    Ok(())
}

#[test]
fn verify_fails_without_a_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    hostguard(&config)?
        .arg("verify")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAIL canonical"));
    Ok(())
}

#[test]
fn reconcile_without_snapshot_is_a_no_op() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path());
    std::fs::write(dir.path().join("hosts"), "0.0.0.0 anything\n")?;
    hostguard(&config)?
        .arg("reconcile")
        .assert()
        .success()
        .stdout(predicate::str::contains("not_initialized"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("hosts"))?,
        "0.0.0.0 anything\n"
    );
    Ok(())
}

#[test]
fn missing_config_file_fails_cleanly() -> Result<()> {
    let dir = TempDir::new()?;
    hostguard(&dir.path().join("absent.toml"))?
        .args(["control", "show"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration file not found"));
    Ok(())
}

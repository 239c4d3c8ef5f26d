//! Integration tests for CLI commands

#![allow(deprecated)]

use assert_cmd::{assert::OutputAssertExt, cargo::CommandCargoExt};
use nowplaying_cli::Config;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Write a config whose session state lives inside `tmp`
fn write_config(tmp: &TempDir, client_id: &str) -> PathBuf {
    let mut config = Config::default();
    config.provider.client_id = client_id.to_string();
    config.session.storage_dir = Some(tmp.path().join("storage"));

    let path = tmp.path().join("config.toml");
    config.save_to(&path).unwrap();
    path
}

fn nowplaying(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("nowplaying").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("nowplaying").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("login"))
        .stdout(predicate::str::contains("complete"))
        .stdout(predicate::str::contains("now-playing"));
}

#[test]
fn test_status_without_session() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "client-123");

    nowplaying(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not authorized"));
}

#[test]
fn test_manual_login_leaves_pending_authorization() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "client-123");

    nowplaying(&config)
        .args(["login", "--manual", "--no-browser"])
        .assert()
        .success()
        .stdout(predicate::str::contains("https://accounts.spotify.com/authorize?"))
        .stdout(predicate::str::contains("code_challenge_method=S256"))
        .stdout(predicate::str::contains("client_id=client-123"));

    nowplaying(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("authorization pending"));
}

#[test]
fn test_complete_rejects_forged_state() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "client-123");

    nowplaying(&config)
        .args(["login", "--manual", "--no-browser"])
        .assert()
        .success();

    nowplaying(&config)
        .args(["complete", "http://127.0.0.1:8888/callback?code=abc&state=forged"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cross-site request forgery"));
}

#[test]
fn test_complete_without_login() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "client-123");

    nowplaying(&config)
        .args(["complete", "code=abc&state=xyz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no authorization request is pending"));
}

#[test]
fn test_login_requires_client_id() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "");

    nowplaying(&config)
        .args(["login", "--manual", "--no-browser"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("client_id"));
}

#[test]
fn test_logout_clears_pending_authorization() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "client-123");

    nowplaying(&config)
        .args(["login", "--manual", "--no-browser"])
        .assert()
        .success();

    nowplaying(&config)
        .arg("logout")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared stored Spotify session"));

    nowplaying(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not authorized"));
}

#[test]
fn test_now_playing_requires_authorization() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(&tmp, "client-123");

    nowplaying(&config)
        .arg("now-playing")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not authorized"));
}

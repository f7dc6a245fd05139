//! Smoke tests -- verify the binary runs and its commands reach the stores.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A settings file pointing every store into `dir`.
fn settings_file(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("veritas.toml");
    let body = format!(
        "[database]\npath = {:?}\n\n[objects]\nroot = {:?}\n\n[logging]\nlevel = \"warn\"\n",
        dir.path().join("veritas.db").display().to_string(),
        dir.path().join("objects").display().to_string(),
    );
    std::fs::write(&path, body).unwrap();
    path
}

fn veritas(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("veritas").unwrap();
    cmd.env_remove("RUST_LOG").arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("veritas")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Test-management portal core"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("veritas")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("veritas"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["config", "get", "--help"],
        vec!["exec", "complete", "--help"],
        vec!["artifacts", "orphans", "--help"],
    ] {
        Command::cargo_bin("veritas").unwrap().args(&args).assert().success();
    }
}

#[test]
fn test_health_against_local_stores() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir);
    veritas(&config)
        .arg("health")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"ok\""));
}

#[test]
fn test_config_set_then_get() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir);
    veritas(&config)
        .args(["config", "set", "minio_bucket", "qa-evidence"])
        .assert()
        .success();
    veritas(&config)
        .args(["config", "get", "minio_bucket"])
        .assert()
        .success()
        .stdout(predicate::str::contains("qa-evidence"));
    veritas(&config)
        .args(["config", "get", "never_written"])
        .assert()
        .failure();
}

#[test]
fn test_execution_lifecycle_from_cli() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir);

    veritas(&config)
        .args(["exec", "create", "--test-case", "1", "--suite", "smoke"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"queued\""));
    veritas(&config).args(["exec", "start", "1"]).assert().success();
    veritas(&config)
        .args(["exec", "start", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot start"));
    veritas(&config)
        .args(["exec", "complete", "1", "--outcome", "passed", "--result", "{\"ok\":true}"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"result_artifact\": \"executions/"));
    veritas(&config)
        .args(["exec", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success_rate\": 100.0"));
    veritas(&config)
        .args(["artifacts", "orphans", "executions"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No orphan artifacts."));
}

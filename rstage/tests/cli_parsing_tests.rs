//! CLI argument parsing tests for rstage
//!
//! These tests verify that command-line arguments and configuration overrides are parsed and
//! validated before any release step runs.

use assert_cmd::Command;
use predicates::prelude::*;

fn rstage() -> Command {
    let mut cmd = Command::cargo_bin("rstage").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_runs() {
    rstage().arg("--help").assert().success();
}

#[test]
fn test_version_runs() {
    rstage().arg("--version").assert().success();
}

#[test]
fn test_subcommand_help_runs() {
    rstage().args(["deploy", "--help"]).assert().success();
    rstage().args(["check", "--help"]).assert().success();
}

#[test]
fn test_subcommand_required() {
    rstage().assert().failure();
}

#[test]
fn test_unknown_subcommand_rejected() {
    rstage().arg("rollback").assert().failure();
}

#[test]
fn test_set_requires_assignment() {
    rstage()
        .args(["deploy", "--set", "deploy_to"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value"));
}

#[test]
fn test_global_args_after_subcommand() {
    rstage()
        .args([
            "deploy",
            "-vv",
            "--summary",
            "--max-open-files",
            "64",
            "--max-workers",
            "2",
            "--help",
        ])
        .assert()
        .success();
}

// ============================================================================
// Configuration validation
// ============================================================================

#[test]
fn test_unknown_compression_rejected() {
    rstage()
        .args([
            "deploy",
            "--set",
            "deploy_to=/nonexistent/app",
            "--set",
            "copy_compression=:foo",
            "--set",
            "repository=/nonexistent/repo",
            "--revision",
            "abc123",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid compression type"));
}

#[test]
fn test_unknown_key_rejected() {
    rstage()
        .args(["deploy", "--set", "deploy_too=/app", "-r", "abc123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown configuration key"));
}

#[test]
fn test_missing_revision_rejected() {
    rstage()
        .args([
            "deploy",
            "--set",
            "deploy_to=/nonexistent/app",
            "--set",
            "repository=/nonexistent/repo",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no revision given"));
}

#[test]
fn test_quiet_suppresses_errors() {
    rstage()
        .args(["deploy", "-q", "--set", "deploy_to=/app"])
        .assert()
        .failure()
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_missing_config_file() {
    rstage()
        .args(["check", "--config", "/nonexistent/rstage.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed reading configuration file"));
}

#[test]
fn test_deploy_from_config_file() -> anyhow::Result<()> {
    let tmp_dir = tempfile::tempdir()?;
    let root = tmp_dir.path();
    let repo = root.join("repo");
    std::fs::create_dir_all(repo.join("lib"))?;
    std::fs::write(repo.join("lib").join("main.rb"), "main\n")?;
    std::fs::write(repo.join("debug.log"), "noise\n")?;
    std::fs::create_dir(root.join("releases"))?;
    let config = serde_json::json!({
        "scm": "none",
        "repository": repo,
        "releases_path": root.join("releases"),
        "release_name": "r1",
        "copy_dir": root.join("copy"),
        "copy_cache": root.join("cache"),
        "copy_remote_dir": root.join("upload"),
        "copy_compression": "gz",
        "rsync_exclude": "*.log",
        "transport": "local"
    });
    let config_path = root.join("rstage.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
    rstage()
        .args(["deploy", "--config"])
        .arg(&config_path)
        .args(["--revision", "abc123", "--summary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("revision: abc123"));
    let release = root.join("releases").join("r1");
    assert_eq!(
        std::fs::read_to_string(release.join("lib").join("main.rb"))?,
        "main\n"
    );
    assert!(!release.join("debug.log").exists());
    assert_eq!(std::fs::read_to_string(release.join("REVISION"))?, "abc123\n");
    assert!(!root.join("copy").join("r1").exists());
    assert!(!root.join("copy").join("r1.tar.gz").exists());
    Ok(())
}

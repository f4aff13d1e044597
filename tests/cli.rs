//! Command-line smoke tests

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn shellpilot() -> Command {
    Command::cargo_bin("shellpilot").unwrap()
}

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.yml");
    std::fs::write(
        &path,
        "prompt: 'cli \\#: '\nlocal_shell: [/bin/bash, --noprofile, --norc, --noediting, -i]\n",
    )
    .unwrap();
    path
}

#[test]
fn test_help_lists_subcommands() {
    shellpilot()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("checkout"))
        .stdout(predicate::str::contains("job"));
}

#[test]
fn test_config_shows_effective_settings() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    shellpilot()
        .arg("--config")
        .arg(&config)
        .args(["--host", "build-01", "--port", "2222", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prompt:"))
        .stdout(predicate::str::contains("hostname: build-01"))
        .stdout(predicate::str::contains("port: 2222"));
}

#[test]
fn test_missing_job_file() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    shellpilot()
        .arg("--config")
        .arg(&config)
        .args(["job", "does-not-exist.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading job file"));
}

#[test]
fn test_unknown_transport_rejected() {
    shellpilot()
        .args(["--transport", "carrier-pigeon", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown transport"));
}

#[test]
fn test_run_locally() {
    if !Path::new("/bin/bash").exists() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    shellpilot()
        .arg("--config")
        .arg(&config)
        .args(["--local", "run", "echo", "hello", "from", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from bash"));

    shellpilot()
        .arg("--config")
        .arg(&config)
        .args(["--local", "run", "(exit 3)"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("return code 3"));
}

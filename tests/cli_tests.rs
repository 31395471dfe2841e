use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_cli_help() {
    let mut cmd = cargo_bin_cmd!("a2a-mesh");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Agent-to-agent messaging mesh"))
        .stdout(predicate::str::contains("relay"))
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_cli_version() {
    let mut cmd = cargo_bin_cmd!("a2a-mesh");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("a2a-mesh"));
}

#[test]
fn test_cli_demo_help() {
    let mut cmd = cargo_bin_cmd!("a2a-mesh");
    cmd.args(["demo", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--query"))
        .stdout(predicate::str::contains("--stop-agent"));
}

#[test]
fn test_cli_config_help() {
    let mut cmd = cargo_bin_cmd!("a2a-mesh");
    cmd.args(["config", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_cli_config_init_then_validate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mesh.toml");

    cargo_bin_cmd!("a2a-mesh")
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    assert!(path.exists());

    cargo_bin_cmd!("a2a-mesh")
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    cargo_bin_cmd!("a2a-mesh")
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn test_cli_config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mesh.toml");
    std::fs::write(&path, "[retry]\nmax_attempts = 0\n").unwrap();

    cargo_bin_cmd!("a2a-mesh")
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("retry.max_attempts"));
}

#[test]
fn test_cli_config_show_json() {
    let dir = TempDir::new().unwrap();
    cargo_bin_cmd!("a2a-mesh")
        .args(["config", "show", "-o", "json", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"relay_addr\""))
        .stdout(predicate::str::contains("\"research\""));
}

#[test]
fn test_cli_demo_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mesh.toml");
    std::fs::write(
        &path,
        "[agent]\nheartbeat_interval_ms = 100\n\n[liveness]\nstale_after_ms = 1000\n",
    )
    .unwrap();

    cargo_bin_cmd!("a2a-mesh")
        .args(["demo", "-o", "json", "--query", "login failures", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"completed\""))
        .stdout(predicate::str::contains("\"sources\""));
}

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_commands() {
    Command::cargo_bin("flowguard")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn config_show_prints_defaults() {
    Command::cargo_bin("flowguard")
        .unwrap()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_attempts: 3"))
        .stdout(predicate::str::contains("buffer_capacity: 64"));
}

#[test]
fn config_init_then_show_roundtrips() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("flowguard.yaml");

    Command::cargo_bin("flowguard")
        .unwrap()
        .args(["config", "init"])
        .arg(&path)
        .assert()
        .success();

    Command::cargo_bin("flowguard")
        .unwrap()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("pending_ttl_secs: 300"));
}

#[test]
fn config_show_with_missing_file_fails() {
    Command::cargo_bin("flowguard")
        .unwrap()
        .args(["config", "show", "--config", "/nonexistent/flowguard.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

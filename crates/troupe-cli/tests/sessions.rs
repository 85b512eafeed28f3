//! Integration tests for `troupe sessions`.


use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_sessions_list_empty() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("troupe")
        .env("TROUPE_HOME", home.path())
        .args(["sessions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions found."));
}

#[test]
fn test_sessions_list_newest_first() {
    let home = TempDir::new().unwrap();
    fixtures::write_session(home.path(), "old-one", "Old", "2024-01-01T00:00:00Z", "first");
    fixtures::write_session(home.path(), "new-one", "New", "2024-06-01T00:00:00Z", "second");

    let output = cargo_bin_cmd!("troupe")
        .env("TROUPE_HOME", home.path())
        .arg("sessions")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let new_at = stdout.find("new-one").unwrap();
    let old_at = stdout.find("old-one").unwrap();
    assert!(new_at < old_at, "{stdout}");
}

#[test]
fn test_sessions_show_relative_reference() {
    let home = TempDir::new().unwrap();
    fixtures::write_session(home.path(), "old-one", "Old", "2024-01-01T00:00:00Z", "first prompt");
    fixtures::write_session(home.path(), "new-one", "New", "2024-06-01T00:00:00Z", "second prompt");

    cargo_bin_cmd!("troupe")
        .env("TROUPE_HOME", home.path())
        .args(["sessions", "show", "-2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("# old-one"))
        .stdout(predicate::str::contains("first prompt"));

    cargo_bin_cmd!("troupe")
        .env("TROUPE_HOME", home.path())
        .args(["sessions", "show", "-3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("session offset -3 out of range"));
}

#[test]
fn test_sessions_show_unknown_id() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("troupe")
        .env("TROUPE_HOME", home.path())
        .args(["sessions", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("session not found: missing"));
}

#[test]
fn test_sessions_delete() {
    let home = TempDir::new().unwrap();
    fixtures::write_session(home.path(), "doomed", "Bye", "2024-01-01T00:00:00Z", "hi");

    cargo_bin_cmd!("troupe")
        .env("TROUPE_HOME", home.path())
        .args(["sessions", "delete", "last"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted session doomed"));

    assert!(!home.path().join("sessions").join("doomed.json").exists());
}

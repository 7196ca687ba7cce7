use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn integration_enabled() -> bool {
    std::env::var("REVBOT_INTEGRATION").is_ok()
}

#[allow(deprecated)]
fn cmd() -> Command {
    Command::cargo_bin("revbot").unwrap()
}

#[test]
fn help_flag() {
    if !integration_enabled() {
        return;
    }
    cmd().arg("--help").assert().success().stdout(predicate::str::contains("revbot"));
}

#[test]
fn wal_inspect_on_missing_file_errors() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .args(["wal", "inspect", "--path"])
        .arg(tmp.path().join("nope.jsonl"))
        .assert()
        .failure();
}

#[test]
fn wal_inspect_reports_counts() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let wal_path = tmp.path().join("wal.jsonl");
    fs::write(
        &wal_path,
        r#"{"id":"1","timestamp":"2026-01-01T00:00:00Z","operation":"post_review","payload":{},"status":"pending","retry_count":0}
"#,
    )
    .unwrap();
    cmd()
        .args(["wal", "inspect", "--path"])
        .arg(&wal_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending\":1"));
}

#[test]
fn ecosystem_show_on_missing_file_prints_empty_context() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .args(["ecosystem", "show", "--path"])
        .arg(tmp.path().join("nope.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"patterns\":[]"));
}

#[test]
fn run_rejects_invalid_repo_string() {
    if !integration_enabled() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(&tmp)
        .args(["run", "--repo", "not-a-repo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected OWNER/NAME"));
}

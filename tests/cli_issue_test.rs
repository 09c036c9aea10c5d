//! Integration tests for issue CLI operations.
//!
//! These tests verify that issue commands work through the CLI:
//! - `issue create/list/show/move/delete`
//! - JSON and human-readable output formats
//! - error output and exit codes

mod common;

use common::{TestEnv, parse_json};
use predicates::prelude::*;

fn create(env: &TestEnv, title: &str) -> String {
    let output = env
        .tracker()
        .args(["issue", "create", title, "--type", "bug", "--priority", "high", "--app-id", "app-x"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    json["id"].as_str().unwrap().to_string()
}

#[test]
fn test_issue_create_json() {
    let env = TestEnv::new();

    env.tracker()
        .args(["issue", "create", "Login fails"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\":\"issue-"))
        .stdout(predicate::str::contains("\"title\":\"Login fails\""))
        .stdout(predicate::str::contains("\"status\":\"open\""));
}

#[test]
fn test_issue_create_human() {
    let env = TestEnv::new();

    env.tracker()
        .args(["-H", "issue", "create", "Login fails"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"issue-[0-9a-f]{8} \[open\] Login fails").unwrap());
}

#[test]
fn test_issue_create_writes_folder_layout() {
    let env = TestEnv::new();
    let id = create(&env, "Login fails");

    let metadata = env.data_path().join("open").join(&id).join("metadata.yaml");
    let yaml = std::fs::read_to_string(metadata).unwrap();
    assert!(yaml.contains("title: Login fails"));
    assert!(yaml.contains("status: open"));
}

#[test]
fn test_issue_create_with_attachment() {
    let env = TestEnv::new();
    let log = env.scenario_path().join("error.log");
    std::fs::write(&log, "Error at line 123").unwrap();

    let output = env
        .tracker()
        .args(["issue", "create", "Crash", "--attach"])
        .arg(&log)
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    let id = json["id"].as_str().unwrap();
    assert_eq!(json["attachments"][0]["path"], "artifacts/error.log");
    assert_eq!(json["attachments"][0]["type"], "text/plain");

    let stored = env.data_path().join("open").join(id).join("artifacts/error.log");
    assert_eq!(std::fs::read_to_string(stored).unwrap(), "Error at line 123");
}

#[test]
fn test_issue_create_blank_title_fails() {
    let env = TestEnv::new();

    env.tracker()
        .args(["issue", "create", "   "])
        .assert()
        .failure()
        .stderr(predicate::str::contains("title is required"));
}

#[test]
fn test_issue_list_filters_by_status() {
    let env = TestEnv::new();
    let first = create(&env, "First");
    create(&env, "Second");

    env.tracker()
        .args(["issue", "move", &first, "completed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"action\":\"moved\""));

    let output = env.tracker().args(["issue", "list", "--status", "open"]).output().unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["count"], 1);
    assert_eq!(json["issues"][0]["title"], "Second");

    let output = env.tracker().args(["issue", "list"]).output().unwrap();
    assert_eq!(parse_json(&output.stdout)["count"], 2);
}

#[test]
fn test_issue_list_human_empty() {
    let env = TestEnv::new();

    env.tracker()
        .args(["-H", "issue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No issues found."));
}

#[test]
fn test_issue_move_sets_resolved_at() {
    let env = TestEnv::new();
    let id = create(&env, "Login fails");

    env.tracker().args(["issue", "move", &id, "active"]).assert().success();
    env.tracker().args(["issue", "move", &id, "completed"]).assert().success();

    let output = env.tracker().args(["issue", "show", &id]).output().unwrap();
    let json = parse_json(&output.stdout);
    assert_eq!(json["status"], "completed");
    assert!(json["metadata"]["resolved_at"].is_string());
    assert!(env.data_path().join("completed").join(&id).is_dir());
    assert!(!env.data_path().join("open").join(&id).exists());
}

#[test]
fn test_issue_move_unknown_status_fails() {
    let env = TestEnv::new();
    let id = create(&env, "Login fails");

    env.tracker()
        .args(["issue", "move", &id, "resolved"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid status"));
}

#[test]
fn test_issue_show_not_found() {
    let env = TestEnv::new();

    env.tracker()
        .args(["issue", "show", "issue-deadbeef"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("\"error\""));

    env.tracker()
        .args(["-H", "issue", "show", "issue-deadbeef"])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"));
}

#[test]
fn test_issue_delete() {
    let env = TestEnv::new();
    let id = create(&env, "Login fails");

    env.tracker()
        .args(["issue", "delete", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"action\":\"deleted\""));

    assert!(!env.data_path().join("open").join(&id).exists());
    env.tracker().args(["issue", "show", &id]).assert().failure();
}

#[test]
fn test_rate_limit_status_when_idle() {
    let env = TestEnv::new();

    env.tracker()
        .args(["rate-limit"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rate_limited\":false"));
}

#[test]
fn test_transcript_outside_scenario_root_rejected() {
    let env = TestEnv::new();

    env.tracker()
        .args(["transcript", "../../etc/passwd"])
        .assert()
        .failure();
}

#[test]
fn test_serve_without_port_fails() {
    let env = TestEnv::new();

    env.tracker()
        .args(["serve"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("port"));
}

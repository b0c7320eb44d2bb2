//! Integration tests for the CLI interface

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const COUNT_CONFIG: &str = r#"
id: 1
atom_matchers:
  - id: 1
    simple_atom_matcher:
      atom_id: 10
count_metrics:
  - id: 100
    what: 1
"#;

const RESTRICTED_CONFIG: &str = r#"
id: 42
restricted_metrics_delegate: com.example.delegate
atom_matchers:
  - id: 1
    simple_atom_matcher:
      atom_id: 999
event_metrics:
  - id: 5
    what: 1
"#;

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("telemd").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("replay"));
}

#[test]
fn test_validate_accepts_valid_config() {
    let temp = TempDir::new().unwrap();
    let config = write(temp.path(), "config.yaml", COUNT_CONFIG);
    let mut cmd = Command::cargo_bin("telemd").unwrap();
    cmd.arg("validate")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK: config 1 compiled"));
}

#[test]
fn test_validate_reports_reason() {
    let temp = TempDir::new().unwrap();
    let broken = COUNT_CONFIG.replace("what: 1", "what: 7");
    let config = write(temp.path(), "config.yaml", &broken);
    let mut cmd = Command::cargo_bin("telemd").unwrap();
    cmd.arg("validate")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config"));
}

#[test]
fn test_validate_rejects_unknown_extension() {
    let temp = TempDir::new().unwrap();
    let config = write(temp.path(), "config.ini", COUNT_CONFIG);
    let mut cmd = Command::cargo_bin("telemd").unwrap();
    cmd.arg("validate").arg(&config).assert().failure();
}

#[test]
fn test_replay_prints_report() {
    let temp = TempDir::new().unwrap();
    let config = write(temp.path(), "config.yaml", COUNT_CONFIG);
    let events = write(
        temp.path(),
        "events.jsonl",
        concat!(
            r#"{"atom_id":10,"elapsed_timestamp_ns":100,"values":[{"int":3}]}"#,
            "\n",
            r#"{"atom_id":11,"elapsed_timestamp_ns":150}"#,
            "\n\n",
            r#"{"atom_id":10,"elapsed_timestamp_ns":200}"#,
            "\n",
        ),
    );
    let mut cmd = Command::cargo_bin("telemd").unwrap();
    cmd.arg("replay")
        .arg("--config")
        .arg(&config)
        .arg("--events")
        .arg(&events)
        .arg("--data-dir")
        .arg(temp.path().join("db"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"metric_id\": 100"))
        .stdout(predicate::str::contains("\"value\": 2"));
}

#[test]
fn test_replay_then_query_restricted_rows() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("db");
    let config = write(temp.path(), "restricted.yaml", RESTRICTED_CONFIG);
    let events = write(
        temp.path(),
        "events.jsonl",
        concat!(
            r#"{"atom_id":999,"elapsed_timestamp_ns":100,"values":[{"int":1}]}"#,
            "\n",
            r#"{"atom_id":999,"elapsed_timestamp_ns":200,"values":[{"int":2}]}"#,
            "\n",
            r#"{"atom_id":999,"elapsed_timestamp_ns":300,"values":[{"int":3}]}"#,
            "\n",
        ),
    );

    Command::cargo_bin("telemd")
        .unwrap()
        .args(["replay", "--uid", "1000"])
        .arg("--config")
        .arg(&config)
        .arg("--events")
        .arg(&events)
        .arg("--data-dir")
        .arg(&data_dir)
        .assert()
        .success();
    assert!(data_dir.join("1000_42.db").exists());

    Command::cargo_bin("telemd")
        .unwrap()
        .args(["query", "--uid", "1000", "--config-id", "42"])
        .arg("--data-dir")
        .arg(&data_dir)
        .args(["--sql", "SELECT elapsedTimestampNs FROM metric_5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("elapsedTimestampNs"))
        .stdout(predicate::str::contains("300"));
}

#[test]
fn test_query_rejects_statements_that_write() {
    let temp = TempDir::new().unwrap();
    Command::cargo_bin("telemd")
        .unwrap()
        .args(["query", "--config-id", "42"])
        .arg("--data-dir")
        .arg(temp.path())
        .args(["--sql", "DELETE FROM metric_5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Only SELECT or WITH"));
}

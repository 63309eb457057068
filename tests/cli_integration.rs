//! Integration tests for the flowguard CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

/// Get a Command for the flowguard binary
fn flowguard() -> Command {
    Command::new(cargo::cargo_bin!("flowguard"))
}

/// Config without backoff sleeps
const FAST_CONFIG: &str = r#"{
  "retryBaseDelayMs": 0,
  "retryMaxDelayMs": 0,
  "retryJitter": 0.0
}"#;

fn write(temp: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = temp.path().join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help() {
    flowguard()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("loop-proof flow control"));
}

#[test]
fn test_version() {
    flowguard()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_missing_project_dir() {
    flowguard()
        .arg("--project")
        .arg("/definitely/not/a/real/dir")
        .arg("transitions")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Project directory does not exist"));
}

#[test]
fn test_transitions_table() {
    flowguard()
        .arg("transitions")
        .assert()
        .success()
        .stdout(predicate::str::contains("HumanReview"))
        .stdout(predicate::str::contains("EscalateToHuman"))
        .stdout(predicate::str::contains("(terminal)"))
        .stdout(predicate::str::is_match(r"Completed\s+-> .*\(terminal\)").unwrap())
        .stdout(predicate::str::is_match(r"Failed\s+-> .*\(terminal\)").unwrap());
}

// =============================================================================
// config
// =============================================================================

#[test]
fn test_config_show_json_defaults() {
    let temp = TempDir::new().unwrap();

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "show", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"failureThreshold\": 3"))
        .stdout(predicate::str::contains("\"historyCap\": 500"));
}

#[test]
fn test_config_show_reads_project_settings() {
    let temp = TempDir::new().unwrap();
    write(&temp, ".flowguard/settings.json", r#"{"failureThreshold": 7}"#);

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Breaker: 7 failures"));
}

#[test]
fn test_config_validate_defaults() {
    let temp = TempDir::new().unwrap();

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("settings.json not found"))
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn test_config_validate_rejects_bad_settings() {
    let temp = TempDir::new().unwrap();
    write(
        &temp,
        ".flowguard/settings.json",
        r#"{"failureThreshold": 0, "maxRepeats": 0}"#,
    );

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("failureThreshold"));
}

#[test]
fn test_config_validate_unparseable_settings() {
    let temp = TempDir::new().unwrap();
    write(&temp, ".flowguard/settings.json", "{ not json");

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "validate"])
        .assert()
        .code(1);
}

#[test]
fn test_config_paths() {
    let temp = TempDir::new().unwrap();

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["config", "paths"])
        .assert()
        .success()
        .stdout(predicate::str::contains(".flowguard"));
}

// =============================================================================
// run
// =============================================================================

#[test]
fn test_run_happy_path() {
    let temp = TempDir::new().unwrap();

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--topic", "ownership", "--original"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Completed"))
        .stdout(predicate::str::contains("Transitions: 7"));
}

#[test]
fn test_run_json_output() {
    let temp = TempDir::new().unwrap();

    let output = flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--topic", "async", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["final_stage"], "Completed");
    assert_eq!(result["topic"], "async");
    assert_eq!(result["state"]["transition_count"], 8);
}

#[test]
fn test_run_scenario_writes_output_file() {
    let temp = TempDir::new().unwrap();
    let config = write(&temp, "fast.json", FAST_CONFIG);
    let scenario = write(
        &temp,
        "scenario.json",
        r#"{
  "request": { "topic": "ownership in practice", "origin": "original" },
  "stages": {
    "Draft": { "script": [{ "outcome": "error", "message": "rate limited" }, { "outcome": "pass" }] }
  },
  "review": { "decisions": ["major", "approve"] }
}"#,
    );
    let out = temp.path().join("result.json");

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .arg("--scenario")
        .arg(&scenario)
        .arg("--config")
        .arg(&config)
        .arg("--output")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Retries: 1"));

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(written["final_stage"], "Completed");
    assert_eq!(written["guard"]["execution_counts"]["draft"], 3);
    assert_eq!(written["guard"]["execution_counts"]["review"], 2);
}

#[test]
fn test_run_oscillating_scenario_exits_with_guard_code() {
    let temp = TempDir::new().unwrap();
    let scenario = write(
        &temp,
        "loop.json",
        r#"{"request": {"topic": "loop", "origin": "original"}, "review": {"decisions": ["major"]}}"#,
    );

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .arg("--scenario")
        .arg(&scenario)
        .assert()
        .code(3)
        .stdout(predicate::str::contains("Failed"))
        .stdout(predicate::str::contains("execution limit"));
}

#[test]
fn test_run_circuit_open_exit_code() {
    let temp = TempDir::new().unwrap();
    let config = write(
        &temp,
        "breaker.json",
        r#"{"retryBaseDelayMs": 0, "retryMaxDelayMs": 0, "retryJitter": 0.0,
            "failureThreshold": 1, "maxRetries": {"draft": 3}}"#,
    );
    let scenario = write(
        &temp,
        "down.json",
        r#"{"request": {"topic": "x", "origin": "original"},
            "stages": {"Draft": {"script": [{"outcome": "fail", "message": "down"}]}}}"#,
    );

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .arg("--scenario")
        .arg(&scenario)
        .arg("--config")
        .arg(&config)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("circuit open"));
}

#[test]
fn test_run_concurrent_runs() {
    let temp = TempDir::new().unwrap();

    let output = flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--topic", "batch", "--original", "--runs", "3", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let results: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r["final_stage"] == "Completed"));
}

#[test]
fn test_run_invalid_scenario() {
    let temp = TempDir::new().unwrap();
    let scenario = write(&temp, "bad.json", r#"{"stages": {}}"#);

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .arg("run")
        .arg("--scenario")
        .arg(&scenario)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad.json"));
}

#[test]
fn test_run_invalid_config_exit_code() {
    let temp = TempDir::new().unwrap();
    let config = write(&temp, "bad.toml", "failureThreshold = 0\n");

    flowguard()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--topic", "x", "--config"])
        .arg(&config)
        .assert()
        .code(7)
        .stderr(predicate::str::contains("failureThreshold"));
}

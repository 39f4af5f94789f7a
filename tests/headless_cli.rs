//! Integration tests for the `livesync` binary's headless output

use std::process::{Command, Output};

use tempfile::TempDir;

fn run_livesync(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_livesync"))
        .args(args)
        .env("LIVESYNC_LOG", "off")
        .output()
        .expect("failed to run livesync")
}

fn events(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line is not JSON"))
        .collect()
}

#[test]
fn test_missing_project_reports_fatal_error() {
    let temp = TempDir::new().unwrap();

    let output = run_livesync(&[temp.path().to_str().unwrap(), "--no-watch"]);

    assert!(!output.status.success());
    let events = events(&output);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "error");
    assert_eq!(events[0]["fatal"], true);
    assert!(events[0]["message"]
        .as_str()
        .unwrap()
        .contains(&*temp.path().file_name().unwrap().to_string_lossy()));
    assert!(events[0]["timestamp"].is_number());
}

#[test]
fn test_project_without_identifier_reports_missing_configuration() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("package.json"),
        r#"{ "name": "demo", "livesync": {} }"#,
    )
    .unwrap();

    let output = run_livesync(&[temp.path().to_str().unwrap(), "--no-watch"]);

    assert!(!output.status.success());
    let events = events(&output);
    assert_eq!(events.len(), 1);
    assert!(events[0]["message"]
        .as_str()
        .unwrap()
        .contains("livesync.id"));
    assert!(!temp.path().join(".livesync").exists());
}

#[test]
fn test_nonexistent_path_fails_before_running() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("nope");

    let output = run_livesync(&[missing.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(events(&output).is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}

//! Harness tests

use std::time::Duration;

use super::{HarnessError, ProcessHandle, ProcessSpec};

#[tokio::test]
async fn spawn_failure_reports_command_name() {
    let spec = ProcessSpec::new("missing", "/nonexistent/binary/path");
    match ProcessHandle::spawn(&spec) {
        Err(HarnessError::Spawn { name, .. }) => assert_eq!(name, "missing"),
        other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn terminate_stops_a_running_process() {
    let spec = ProcessSpec::new("sleeper", "sh").args(["-c", "sleep 30"]);
    let mut handle = ProcessHandle::spawn(&spec).unwrap();

    assert!(handle.exit_status().is_none());
    handle.terminate().await;
    // A second wait must observe the exit immediately
    assert!(handle.wait_exit(Duration::from_secs(1)).await.is_some() || handle.exit_status().is_some());
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let spec = ProcessSpec::new("sleeper", "sh").args(["-c", "sleep 30"]);
    let mut handle = ProcessHandle::spawn(&spec).unwrap();

    handle.terminate().await;
    // Second call must neither error nor hang
    handle.terminate().await;
}

#[tokio::test]
async fn terminate_after_natural_exit_is_a_noop() {
    let spec = ProcessSpec::new("oneshot", "sh").args(["-c", "exit 0"]);
    let mut handle = ProcessHandle::spawn(&spec).unwrap();

    let status = handle.wait_exit(Duration::from_secs(5)).await.unwrap();
    assert!(status.success());
    handle.terminate().await;
}

#[tokio::test]
async fn helper_exit_status_is_observable() {
    let spec = ProcessSpec::new("failing", "sh").args(["-c", "exit 3"]);
    let mut handle = ProcessHandle::spawn(&spec).unwrap();

    let status = handle.wait_exit(Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.code(), Some(3));
}

#[tokio::test]
async fn stderr_is_captured_for_failure_reports() {
    let spec = ProcessSpec::new("noisy", "sh").args(["-c", "echo broker said no >&2; exit 1"]);
    let mut handle = ProcessHandle::spawn(&spec).unwrap();

    handle.wait_exit(Duration::from_secs(5)).await;
    handle.terminate().await;
    let stderr = handle.stderr_output().await;
    assert!(stderr.contains("broker said no"), "stderr was: {:?}", stderr);
}

#[tokio::test]
async fn environment_is_forwarded_verbatim() {
    let spec = ProcessSpec::new("env-echo", "sh")
        .args(["-c", "printf '%s' \"$CONFORMQ_PROBE\" >&2"])
        .env("CONFORMQ_PROBE", "lib/path:other/path");
    let mut handle = ProcessHandle::spawn(&spec).unwrap();

    handle.wait_exit(Duration::from_secs(5)).await;
    let stderr = handle.stderr_output().await;
    assert_eq!(stderr, "lib/path:other/path");
}

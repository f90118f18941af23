/*!
 * Stop Escalation Tests
 * A worker whose process ignores both the SHUTDOWN request and SIGTERM
 */

use super::common;
use bot_orchestrator::ipc::SendOutcome;
use bot_orchestrator::{IpcMessage, Orchestrator, ProcessState, WorkerConfig};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// The real worker runs in the foreground of a shell that ignores SIGTERM
/// and keeps running after the worker exits
async fn stubborn_orchestrator(root: &std::path::Path) -> Orchestrator {
    let script = format!(
        "trap '' TERM; '{}' \"$@\"; while :; do sleep 1; done",
        common::worker_binary().display()
    );
    let mut config = common::config(root);
    config.worker_program = PathBuf::from("/bin/sh");
    config.worker_args = vec!["-c".into(), script, "sh".into()];
    Orchestrator::new(config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_stop_escalates_to_kill() {
    let root = tempfile::tempdir().unwrap();
    let orch = stubborn_orchestrator(root.path()).await;
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();

    let started = Instant::now();
    let exited = orch
        .stop_with_timeout("w1", true, Duration::from_millis(600))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(exited);
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Stopped));
    assert_eq!(orch.metrics().counter("workers.killed"), 1.0);
    assert!(orch.worker_info("w1").unwrap().os_pid.is_none());
    // graceful wait + terminate wait + kill confirmation
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "{:?}", elapsed);
    assert!(!orch.allocator().has_allocation("w1"));

    orch.shutdown_all(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_non_graceful_stop_skips_the_request() {
    let root = tempfile::tempdir().unwrap();
    let orch = stubborn_orchestrator(root.path()).await;
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();

    // Let the worker itself exit so only the stubborn shell remains
    let outcome = orch
        .ipc()
        .send("w1", IpcMessage::shutdown(true).with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Response(_)));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    assert!(orch
        .stop_with_timeout("w1", false, Duration::from_secs(2))
        .await
        .unwrap());
    let elapsed = started.elapsed();

    // Half the timeout for SIGTERM, then the kill; no graceful wait before them
    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "{:?}", elapsed);
    assert_eq!(orch.metrics().counter("workers.killed"), 1.0);

    orch.shutdown_all(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_shutdown_all_kills_stubborn_workers() {
    let root = tempfile::tempdir().unwrap();
    let orch = stubborn_orchestrator(root.path()).await;
    for id in ["w1", "w2"] {
        orch.create(id, WorkerConfig::new(id)).await.unwrap();
        orch.start(id).await.unwrap();
    }

    let started = Instant::now();
    let report = orch.shutdown_all(Duration::from_millis(900)).await;

    assert_eq!(report.stopped + report.forced, 2);
    assert!(started.elapsed() < Duration::from_secs(8));
    for id in ["w1", "w2"] {
        assert!(orch.worker_info(id).unwrap().os_pid.is_none());
    }
}

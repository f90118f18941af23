/*!
 * Supervision Tests
 * Real worker processes: start, stop, pause, restart, exits and fleet shutdown
 */

use super::common::{self, path};
use bot_orchestrator::ipc::SendOutcome;
use bot_orchestrator::{
    IpcMessage, Orchestrator, OrchestratorError, ProcessState, RestartPolicy, TransitionTrigger, WorkerConfig,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use std::time::Duration;

fn process_exists(os_pid: u32) -> bool {
    kill(Pid::from_raw(os_pid as i32), None).is_ok()
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_start_and_graceful_stop() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;

    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();

    let info = orch.worker_info("w1").unwrap();
    assert_eq!(info.state, ProcessState::Running);
    let os_pid = info.os_pid.unwrap();
    assert!(process_exists(os_pid));
    let allocation = info.allocation.unwrap();
    assert!((allocation.limits.memory_mb - 256.0).abs() < 1e-9);
    assert!(orch.monitor().is_registered("w1"));

    let status = orch
        .ipc()
        .request_with_timeout("w1", "status", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    let status = status.payload().unwrap();
    assert_eq!(status["worker_id"], "w1");
    assert_eq!(status["running"], true);

    assert!(orch.stop("w1", true).await.unwrap());
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Stopped));
    assert!(!orch.allocator().has_allocation("w1"));
    assert!(!orch.monitor().is_registered("w1"));
    assert_eq!(orch.metrics().counter("workers.killed"), 0.0);
    assert!(!process_exists(os_pid));

    assert_eq!(
        path(&orch, "w1"),
        vec![
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Stopping,
            ProcessState::Stopped
        ]
    );
    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_pause_suspends_the_process() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();

    orch.pause("w1").await.unwrap();
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Paused));
    let outcome = orch
        .ipc()
        .request_with_timeout("w1", "ping", json!({}), Duration::from_millis(300))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Timeout));

    orch.resume("w1").await.unwrap();
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Running));
    // The ping queued while paused is answered late; a fresh one must succeed
    let outcome = orch
        .ipc()
        .request_with_timeout("w1", "ping", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Response(_)));

    // Pausing twice is not a valid transition
    orch.pause("w1").await.unwrap();
    assert!(matches!(
        orch.pause("w1").await.unwrap_err(),
        OrchestratorError::Lifecycle(_)
    ));

    // A paused worker can still be stopped
    assert!(orch.stop("w1", true).await.unwrap());
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Stopped));
    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_paused_worker_keeps_its_channel() {
    let root = tempfile::tempdir().unwrap();
    let mut config = common::config(root.path());
    config.ipc.idle_timeout = Duration::from_millis(200);
    config.ipc.heartbeat_interval = Duration::from_secs(60);
    config.ipc.cleanup_interval = Duration::from_secs(60);
    let orch = Orchestrator::new(config).await.unwrap();
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();
    orch.pause("w1").await.unwrap();
    orch.create("w2", WorkerConfig::new("w2")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let reaped = orch.ipc().cleanup_idle().await;
    assert!(!reaped.contains(&"w1".to_string()));
    assert!(reaped.contains(&"w2".to_string()));
    assert!(orch.ipc().has_channel("w1"));

    orch.resume("w1").await.unwrap();
    let outcome = orch
        .ipc()
        .request_with_timeout("w1", "ping", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Response(_)));
    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_restart_replaces_the_process() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();
    let first = orch.worker_info("w1").unwrap().os_pid.unwrap();

    orch.restart("w1").await.unwrap();

    let info = orch.worker_info("w1").unwrap();
    assert_eq!(info.state, ProcessState::Running);
    assert_eq!(info.restarts, 1);
    let second = info.os_pid.unwrap();
    assert_ne!(first, second);
    assert!(!process_exists(first));
    assert!(path(&orch, "w1").contains(&ProcessState::Restarting));
    // The reservation survives the restart
    assert!(orch.allocator().has_allocation("w1"));

    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_clean_exit_follows_restart_policy() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;

    let on_failure = WorkerConfig::new("w1");
    let always = WorkerConfig::new("w2").with_restart_policy(RestartPolicy::Always);
    orch.create("w1", on_failure).await.unwrap();
    orch.create("w2", always).await.unwrap();
    orch.start("w1").await.unwrap();
    orch.start("w2").await.unwrap();
    let first_w2 = orch.worker_info("w2").unwrap().os_pid.unwrap();

    // Ask both workers to exit on their own
    for id in ["w1", "w2"] {
        let outcome = orch
            .ipc()
            .send(id, IpcMessage::shutdown(true).with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Response(_)));
    }
    let fleet = &orch;
    assert!(common::eventually(Duration::from_secs(10), move || async move {
        fleet.monitor_tick().await;
        fleet.lifecycle().state("w1") == Some(ProcessState::Stopped)
            && path(fleet, "w2").contains(&ProcessState::Failed)
    })
    .await);
    let last = orch.lifecycle().history("w1").pop().unwrap();
    assert_eq!(last.trigger, TransitionTrigger::External);
    assert!(!orch.allocator().has_allocation("w1"));

    // ALWAYS relaunches even after a clean exit
    assert!(common::eventually(Duration::from_secs(15), move || async move {
        fleet
            .worker_info("w2")
            .is_some_and(|w| w.state == ProcessState::Running && w.os_pid != Some(first_w2))
    })
    .await);
    assert!(path(&orch, "w2").contains(&ProcessState::Recovering));

    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_monitor_tick_checks_health() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();

    orch.monitor_tick().await;

    let health = orch.worker_info("w1").unwrap().health.unwrap();
    assert!(health.is_healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert!(orch.lifecycle().stats().health_checks >= 1);
    assert_eq!(orch.metrics().gauge("fleet.running"), Some(1.0));
    if let Some(usage) = orch.monitor().usage("w1") {
        // Reported by the worker itself
        assert_eq!(usage.threads, 1);
    }

    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_shutdown_all_stops_the_fleet() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    orch.start_monitoring();

    let mut pids = Vec::new();
    for id in ["w1", "w2"] {
        orch.create(id, WorkerConfig::new(id)).await.unwrap();
        orch.start(id).await.unwrap();
        pids.push(orch.worker_info(id).unwrap().os_pid.unwrap());
    }
    orch.create("idle", WorkerConfig::new("idle")).await.unwrap();

    let report = orch.shutdown_all(Duration::from_secs(10)).await;
    assert_eq!(report.stopped, 3);
    assert_eq!(report.forced, 0);
    assert!(orch.is_closed());
    assert!(pids.iter().all(|pid| !process_exists(*pid)));
    assert_eq!(orch.allocator().total_allocated().memory_mb, 0.0);

    // Closed for business; a second shutdown is a no-op
    assert!(orch.create("w3", WorkerConfig::new("w3")).await.is_err());
    assert_eq!(orch.shutdown_all(Duration::from_secs(1)).await, Default::default());
}

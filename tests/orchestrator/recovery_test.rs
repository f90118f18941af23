/*!
 * Recovery Tests
 * Crashes and failed health checks driven through the monitoring pass
 */

use super::common::{self, path, wait_for_state};
use bot_orchestrator::{ProcessState, RestartPolicy, WorkerConfig};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::time::Duration;

fn sigkill(os_pid: u32) {
    kill(Pid::from_raw(os_pid as i32), Signal::SIGKILL).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_crashed_worker_is_relaunched() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.start("w1").await.unwrap();
    let first = orch.worker_info("w1").unwrap().os_pid.unwrap();

    sigkill(first);
    let fleet = &orch;
    assert!(common::eventually(Duration::from_secs(15), move || async move {
        fleet.monitor_tick().await;
        fleet
            .worker_info("w1")
            .is_some_and(|w| w.state == ProcessState::Running && w.os_pid.is_some_and(|p| p != first))
    })
    .await);

    let info = orch.worker_info("w1").unwrap();
    assert_eq!(info.recovery_attempts, 0);
    assert_eq!(orch.metrics().counter("workers.crashed"), 1.0);
    assert_eq!(orch.metrics().counter("workers.recovered"), 1.0);
    let path = path(&orch, "w1");
    assert_eq!(
        &path[path.len() - 4..],
        &[
            ProcessState::Failed,
            ProcessState::Recovering,
            ProcessState::Starting,
            ProcessState::Running
        ]
    );

    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_never_policy_leaves_crash_failed() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let config = WorkerConfig::new("w1").with_restart_policy(RestartPolicy::Never);
    orch.create("w1", config).await.unwrap();
    orch.start("w1").await.unwrap();

    sigkill(orch.worker_info("w1").unwrap().os_pid.unwrap());
    let fleet = &orch;
    assert!(common::eventually(Duration::from_secs(10), move || async move {
        fleet.monitor_tick().await;
        fleet.lifecycle().state("w1") == Some(ProcessState::Failed)
    })
    .await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Failed));
    assert_eq!(orch.metrics().counter("workers.fatal"), 1.0);
    assert_eq!(orch.metrics().counter("workers.recovered"), 0.0);

    // An operator can still bring it back by hand
    orch.start("w1").await.unwrap();
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Running));

    orch.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_failed_health_checks_trigger_recovery() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let mut config = WorkerConfig::new("w1");
    config.health_check_interval = Duration::from_millis(10);
    orch.create("w1", config).await.unwrap();
    orch.start("w1").await.unwrap();
    let first = orch.worker_info("w1").unwrap().os_pid.unwrap();

    // Without a mailbox every ping fails at once
    assert!(orch.ipc().remove_channel("w1").await.unwrap());

    let fleet = &orch;
    assert!(common::eventually(Duration::from_secs(10), move || async move {
        fleet.monitor_tick().await;
        path(fleet, "w1").contains(&ProcessState::Failed)
    })
    .await);
    let failure = orch
        .lifecycle()
        .history("w1")
        .into_iter()
        .find(|t| t.to == ProcessState::Failed)
        .unwrap();
    assert!(failure.error.unwrap_or_default().contains("Health score"));

    // The relaunch gets a fresh mailbox and a fresh process
    assert!(wait_for_state(&orch, "w1", ProcessState::Running).await);
    let info = orch.worker_info("w1").unwrap();
    assert_ne!(info.os_pid, Some(first));
    assert!(orch.ipc().has_channel("w1"));
    assert!(root.path().join("w1").join("inbox").is_dir());

    orch.shutdown_all(Duration::from_secs(5)).await;
}

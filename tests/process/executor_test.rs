/*!
 * Process Executor Tests
 * Real OS processes: signals, exit detection, environment
 */

use bot_orchestrator::process::{ExecutionConfig, ProcessExecutor, ProcessSignal};
use serial_test::serial;
use std::time::Duration;

fn sh(script: &str) -> ExecutionConfig {
    ExecutionConfig::new("/bin/sh").with_args(["-c", script])
}

#[tokio::test]
#[serial]
async fn test_stop_and_continue_signals() {
    let executor = ProcessExecutor::new();
    executor.spawn("w1", &sh("sleep 30")).unwrap();

    assert!(executor.signal("w1", ProcessSignal::Stop));
    // A stopped process is still alive
    assert!(!executor.wait_for_exit("w1", Duration::from_millis(100)).await);
    assert!(executor.is_alive("w1"));

    assert!(executor.signal("w1", ProcessSignal::Continue));
    assert!(executor.kill("w1"));
    assert!(executor.wait_for_exit("w1", Duration::from_secs(5)).await);
    assert!(!executor.exit_status("w1").unwrap().success());
}

#[tokio::test]
#[serial]
async fn test_sigterm_ignored_then_killed() {
    let executor = ProcessExecutor::new();
    executor
        .spawn("w1", &sh("trap '' TERM; while true; do sleep 1; done"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(executor.terminate("w1"));
    assert!(!executor.wait_for_exit("w1", Duration::from_millis(300)).await);

    assert!(executor.kill("w1"));
    assert!(executor.wait_for_exit("w1", Duration::from_secs(5)).await);
}

#[tokio::test]
#[serial]
async fn test_environment_reaches_child() {
    let executor = ProcessExecutor::new();
    let config = sh("test \"$WORKER_MODE\" = batch").with_env("WORKER_MODE", "batch");
    executor.spawn("w1", &config).unwrap();

    assert!(executor.wait_for_exit("w1", Duration::from_secs(5)).await);
    assert!(executor.exit_status("w1").unwrap().success());
    assert_eq!(executor.remove("w1").map(|s| s.success()), Some(true));
    assert!(executor.os_pid("w1").is_none());
}

#[tokio::test]
#[serial]
async fn test_signal_to_unknown_process_fails() {
    let executor = ProcessExecutor::new();
    assert!(!executor.signal("ghost", ProcessSignal::Terminate));
    assert!(executor.wait_for_exit("ghost", Duration::from_millis(10)).await);
}

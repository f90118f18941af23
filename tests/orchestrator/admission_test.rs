/*!
 * Admission Tests
 * Fleet ceilings and worker registration; nothing here spawns a worker
 */

use super::common;
use bot_orchestrator::resources::ResourceLimits;
use bot_orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorError, Priority, ProcessState, RestartPolicy, WorkerConfig,
};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};

async fn orchestrator_with(root: &Path, tweak: impl FnOnce(&mut OrchestratorConfig)) -> Orchestrator {
    let mut config = common::config(root);
    tweak(&mut config);
    Orchestrator::new(config).await.unwrap()
}

fn denied_reason(err: OrchestratorError) -> String {
    match err {
        OrchestratorError::AdmissionDenied { reason, .. } => reason,
        other => panic!("expected admission denial, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_worker_rejected() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;

    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    let err = orch.create("w1", WorkerConfig::new("w1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkerExists(ref id) if id == "w1"));

    // The original registration is untouched
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Initializing));
    assert_eq!(orch.list_workers().len(), 1);
}

#[tokio::test]
async fn test_worker_count_ceiling() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator_with(root.path(), |c| c.max_workers = 2).await;

    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    orch.create("w2", WorkerConfig::new("w2")).await.unwrap();
    let reason = denied_reason(orch.create("w3", WorkerConfig::new("w3")).await.unwrap_err());
    assert!(reason.contains("worker ceiling"), "{}", reason);
    assert!(!orch.has_worker("w3"));
    assert!(!orch.lifecycle().is_registered("w3"));
    assert!(!orch.ipc().has_channel("w3"));
}

#[tokio::test]
async fn test_memory_ceiling_uses_priority_defaults() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator_with(root.path(), |c| c.max_total_memory_mb = 600.0).await;

    // Normal: 256 MB by default
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();

    // Critical doubles the baseline: 256 + 512 is over 600
    let critical = WorkerConfig::new("w2").with_priority(Priority::Critical);
    let reason = denied_reason(orch.create("w2", critical).await.unwrap_err());
    assert!(reason.contains("memory"), "{}", reason);

    // Low halves it: 256 + 128 fits
    let low = WorkerConfig::new("w3").with_priority(Priority::Low);
    orch.create("w3", low).await.unwrap();
}

#[tokio::test]
async fn test_cpu_ceiling_uses_explicit_limits() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator_with(root.path(), |c| c.max_total_cpu_percent = 60.0).await;

    let heavy = WorkerConfig::new("w1").with_limits(ResourceLimits::default().with_cpu(50.0));
    orch.create("w1", heavy).await.unwrap();

    let extra = WorkerConfig::new("w2").with_limits(ResourceLimits::default().with_cpu(20.0));
    let reason = denied_reason(orch.create("w2", extra).await.unwrap_err());
    assert!(reason.contains("CPU"), "{}", reason);

    // Destroying frees the admission budget
    orch.destroy("w1").await.unwrap();
    let extra = WorkerConfig::new("w2").with_limits(ResourceLimits::default().with_cpu(20.0));
    orch.create("w2", extra).await.unwrap();
}

#[tokio::test]
async fn test_reserved_and_unsafe_ids_rejected() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;

    for id in ["supervisor", "../escape", ""] {
        let err = orch.create(id, WorkerConfig::new(id)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)), "{}: {:?}", id, err);
    }
    assert!(orch.list_workers().is_empty());
}

#[tokio::test]
async fn test_create_registers_without_reserving() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;

    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    let info = orch.worker_info("w1").unwrap();
    assert_eq!(info.state, ProcessState::Initializing);
    assert_eq!(info.os_pid, None);
    assert_eq!(info.allocation, None);
    assert!(root.path().join("w1").join("inbox").is_dir());

    // Stopping a worker that never started is immediate
    assert!(orch.stop("w1", true).await.unwrap());
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Stopped));

    orch.destroy("w1").await.unwrap();
    assert!(!orch.has_worker("w1"));
    assert!(!root.path().join("w1").exists());
    assert!(matches!(
        orch.start("w1").await.unwrap_err(),
        OrchestratorError::WorkerNotFound(_)
    ));
}

#[tokio::test]
async fn test_spawn_failure_marks_worker_failed() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator_with(root.path(), |c| {
        c.worker_program = PathBuf::from("/nonexistent/worker-binary");
    })
    .await;

    let config = WorkerConfig::new("w1").with_restart_policy(RestartPolicy::Never);
    orch.create("w1", config).await.unwrap();

    let err = orch.start("w1").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SpawnFailed { .. }), "{:?}", err);
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Failed));
    assert_eq!(orch.lifecycle().recovery_attempts("w1"), Some(0));
    assert_eq!(orch.metrics().counter("workers.fatal"), 1.0);
}

#[tokio::test]
async fn test_failed_registration_leaves_no_trace() {
    let root = tempfile::tempdir().unwrap();
    let orch = orchestrator_with(root.path(), |c| c.max_workers = 1).await;

    // A plain file where the mailbox directory should go
    std::fs::write(root.path().join("w1"), b"occupied").unwrap();
    let err = orch.create("w1", WorkerConfig::new("w1")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Ipc(_)), "{:?}", err);
    assert!(!orch.has_worker("w1"));
    assert!(!orch.lifecycle().is_registered("w1"));

    // The failed attempt does not count against the worker ceiling
    std::fs::remove_file(root.path().join("w1")).unwrap();
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();
    assert_eq!(orch.lifecycle().state("w1"), Some(ProcessState::Initializing));
}

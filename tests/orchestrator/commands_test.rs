/*!
 * Command Registry Tests
 * Default commands executed against a live supervisor
 */

use super::common;
use bot_orchestrator::ipc::handler;
use bot_orchestrator::{CommandRegistry, IpcManager, IpcMessage, Permission, ProcessState, WorkerConfig};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const OPERATOR: &[Permission] = &[Permission::Read, Permission::Control];
const ADMIN: &[Permission] = &[Permission::Read, Permission::Control, Permission::Admin];

#[tokio::test]
async fn test_create_and_inspect_through_commands() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let registry = CommandRegistry::with_defaults();

    let created = registry
        .execute(
            &orch,
            "create_worker",
            json!({ "worker_id": "w1", "config": { "priority": "high", "restart_policy": "never" } }),
            OPERATOR,
        )
        .await;
    assert!(created.success, "{:?}", created.error);
    assert_eq!(created.data["state"], json!(ProcessState::Initializing));

    let status = registry
        .execute(&orch, "worker_status", json!({ "worker_id": "w1" }), OPERATOR)
        .await;
    assert!(status.success);
    assert_eq!(status.data["priority"], "high");
    assert_eq!(status.data["restart_policy"], "never");

    let listed = registry
        .execute(&orch, "list_workers", json!({ "state": "initializing" }), &[Permission::Read])
        .await;
    assert_eq!(listed.data.as_array().map(Vec::len), Some(1));

    let stats = registry.execute(&orch, "fleet_stats", Value::Null, &[Permission::Read]).await;
    assert!(stats.success);
    assert_eq!(stats.data["workers"], 1);
    assert!(stats.execution_time_ms >= 0.0);
}

#[tokio::test]
async fn test_failures_are_reported_in_the_result() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let registry = CommandRegistry::with_defaults();

    let unknown = registry.execute(&orch, "reboot_host", Value::Null, ADMIN).await;
    assert!(!unknown.success);
    assert!(unknown.error.unwrap().contains("Unknown command"));

    let missing = registry.execute(&orch, "worker_status", json!({}), ADMIN).await;
    assert!(!missing.success);
    assert!(missing.error.unwrap().contains("worker_id"));

    let wrong_type = registry
        .execute(&orch, "worker_status", json!({ "worker_id": 7 }), ADMIN)
        .await;
    assert!(!wrong_type.success);

    let absent = registry
        .execute(&orch, "worker_status", json!({ "worker_id": "ghost" }), ADMIN)
        .await;
    assert!(!absent.success);
    assert_eq!(absent.data, Value::Null);
}

#[tokio::test]
async fn test_destroy_requires_admin() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let registry = CommandRegistry::with_defaults();
    registry
        .execute(&orch, "create_worker", json!({ "worker_id": "w1" }), OPERATOR)
        .await;

    let denied = registry
        .execute(&orch, "destroy_worker", json!({ "worker_id": "w1" }), OPERATOR)
        .await;
    assert!(!denied.success);
    assert!(denied.error.unwrap().contains("admin"));
    assert!(orch.has_worker("w1"));

    let destroyed = registry
        .execute(&orch, "destroy_worker", json!({ "worker_id": "w1" }), ADMIN)
        .await;
    assert!(destroyed.success);
    assert!(!orch.has_worker("w1"));
}

#[tokio::test]
async fn test_history_and_resource_views() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let registry = CommandRegistry::with_defaults();
    registry
        .execute(&orch, "create_worker", json!({ "worker_id": "w1" }), OPERATOR)
        .await;
    registry
        .execute(&orch, "stop_worker", json!({ "worker_id": "w1" }), OPERATOR)
        .await;

    let history = registry
        .execute(&orch, "transition_history", json!({ "worker_id": "w1", "limit": 1 }), OPERATOR)
        .await;
    assert!(history.success);
    let entries = history.data.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["to"], json!(ProcessState::Stopped));

    let allocations = registry.execute(&orch, "allocations", Value::Null, OPERATOR).await;
    assert!(allocations.success);
    assert_eq!(allocations.data["allocations"], json!([]));
    assert_eq!(allocations.data["capacity"], json!(orch.allocator().capacity()));

    let optimized = registry
        .execute(&orch, "optimize_resources", Value::Null, OPERATOR)
        .await;
    assert!(optimized.success);
    assert_eq!(optimized.data["considered"], 0);

    let broadcast = registry
        .execute(&orch, "broadcast", json!({ "event": "config_reloaded" }), OPERATOR)
        .await;
    assert!(broadcast.success);
    assert_eq!(broadcast.data["delivered"], 1);
}

#[tokio::test]
async fn test_worker_command_reports_each_outcome() {
    let root = tempfile::tempdir().unwrap();
    let orch = common::orchestrator(root.path()).await;
    let registry = CommandRegistry::with_defaults();
    orch.create("w1", WorkerConfig::new("w1")).await.unwrap();

    // Worker side of the mailbox, without spawning a process
    let worker = IpcManager::new(orch.config().ipc.clone(), "w1").await.unwrap();
    worker
        .register_handler("w1", "echo", handler(|msg: IpcMessage| async move { Ok(msg.payload) }))
        .unwrap();
    worker
        .register_handler(
            "w1",
            "explode",
            handler(|_msg: IpcMessage| async move { Err(anyhow::anyhow!("disk full")) }),
        )
        .unwrap();
    worker.start();

    let answered = registry
        .execute(
            &orch,
            "worker_command",
            json!({ "worker_id": "w1", "command": "echo", "payload": { "n": 7 }, "timeout_ms": 5000 }),
            OPERATOR,
        )
        .await;
    assert!(answered.success, "{:?}", answered.error);
    assert_eq!(answered.data["response"]["n"], 7);

    let remote = registry
        .execute(
            &orch,
            "worker_command",
            json!({ "worker_id": "w1", "command": "explode", "timeout_ms": 5000 }),
            OPERATOR,
        )
        .await;
    assert!(!remote.success);
    let error = remote.error.unwrap();
    assert!(error.contains("rejected explode") && error.contains("disk full"), "{}", error);

    worker.shutdown().await;
    let silent = registry
        .execute(
            &orch,
            "worker_command",
            json!({ "worker_id": "w1", "command": "echo", "timeout_ms": 200 }),
            OPERATOR,
        )
        .await;
    assert!(!silent.success);
    assert!(silent.error.unwrap().contains("No response"));
    assert_eq!(orch.ipc().pending_requests(), 0);

    let unknown = registry
        .execute(&orch, "worker_command", json!({ "worker_id": "ghost", "command": "echo" }), OPERATOR)
        .await;
    assert!(!unknown.success);
    assert!(unknown.error.unwrap().contains("not found"));

    let read_only = registry
        .execute(&orch, "worker_command", json!({ "worker_id": "w1", "command": "echo" }), &[Permission::Read])
        .await;
    assert!(!read_only.success);
}

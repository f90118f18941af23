/*!
 * Shared fixtures for orchestrator tests
 */

use bot_orchestrator::core::RecoveryConfig;
use bot_orchestrator::{IpcConfig, Orchestrator, OrchestratorConfig, ProcessState};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_worker"))
}

/// Short intervals and the real worker binary, rooted at `root`
pub fn config(root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        ipc: IpcConfig {
            delivery_interval: Duration::from_millis(10),
            ..IpcConfig::with_root(root)
        },
        worker_program: worker_binary(),
        stop_timeout: Duration::from_secs(3),
        recovery: RecoveryConfig {
            backoff: vec![Duration::from_millis(50)],
            ..RecoveryConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

pub async fn orchestrator(root: &Path) -> Orchestrator {
    Orchestrator::new(config(root)).await.unwrap()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

pub async fn wait_for_state(orch: &Orchestrator, worker_id: &str, state: ProcessState) -> bool {
    eventually(Duration::from_secs(15), move || async move {
        orch.lifecycle().state(worker_id) == Some(state)
    })
    .await
}

pub fn path(orch: &Orchestrator, worker_id: &str) -> Vec<ProcessState> {
    orch.lifecycle()
        .history(worker_id)
        .iter()
        .filter(|t| t.success)
        .map(|t| t.to)
        .collect()
}

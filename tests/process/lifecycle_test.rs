/*!
 * Lifecycle Manager Tests
 * State machine, hooks and recovery driven through the public API
 */

use bot_orchestrator::core::{RecoveryConfig, StateTimeouts};
use bot_orchestrator::process::{
    hook, recovery_action, HookContext, HookEvent, LifecycleConfig, LifecycleHook, LifecycleManager,
    ProcessState, TransitionTrigger,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_recovery() -> RecoveryConfig {
    RecoveryConfig {
        backoff: vec![Duration::from_millis(10)],
        ..RecoveryConfig::default()
    }
}

async fn running(lm: &LifecycleManager, id: &str) {
    lm.register_process(id).unwrap();
    lm.start(id).await.unwrap();
    lm.complete(id, TransitionTrigger::Automatic).await.unwrap();
    assert_eq!(lm.state(id), Some(ProcessState::Running));
}

#[tokio::test]
async fn test_full_lifecycle_history() {
    let lm = LifecycleManager::new(LifecycleConfig::default());
    running(&lm, "w1").await;

    lm.pause("w1").await.unwrap();
    lm.complete("w1", TransitionTrigger::Signal).await.unwrap();
    lm.resume("w1").await.unwrap();
    lm.complete("w1", TransitionTrigger::Signal).await.unwrap();
    lm.stop("w1").await.unwrap();
    lm.complete("w1", TransitionTrigger::Manual).await.unwrap();
    lm.terminate("w1").await.unwrap();

    let path: Vec<ProcessState> = lm.history("w1").iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Pausing,
            ProcessState::Paused,
            ProcessState::Resuming,
            ProcessState::Running,
            ProcessState::Stopping,
            ProcessState::Stopped,
            ProcessState::Terminated,
        ]
    );
    assert!(lm.history("w1").iter().all(|t| t.success));

    // TERMINATED is absorbing
    assert!(lm.start("w1").await.is_err());
    assert_eq!(lm.state("w1"), Some(ProcessState::Terminated));
}

#[tokio::test]
async fn test_hook_sees_transition_and_scope() {
    let lm = LifecycleManager::new(LifecycleConfig::default());
    let seen: Arc<Mutex<Vec<(String, ProcessState, ProcessState)>>> = Arc::default();
    let sink = seen.clone();
    lm.register_hook(
        LifecycleHook::new(
            "observe-stop",
            HookEvent::AfterStop,
            hook(move |ctx: HookContext| {
                let sink = sink.clone();
                async move {
                    sink.lock().push((ctx.process_id, ctx.from, ctx.to));
                    Ok(())
                }
            }),
        )
        .for_process("w1"),
    );

    for id in ["w1", "w2"] {
        running(&lm, id).await;
        lm.stop(id).await.unwrap();
        lm.complete(id, TransitionTrigger::Manual).await.unwrap();
    }

    assert_eq!(
        *seen.lock(),
        vec![("w1".to_string(), ProcessState::Stopping, ProcessState::Stopped)]
    );
}

#[tokio::test]
async fn test_failing_before_hook_does_not_block_transition() {
    let lm = LifecycleManager::new(LifecycleConfig::default());
    lm.on(
        HookEvent::BeforeStart,
        "always-fails",
        hook(|_| async { anyhow::bail!("no capacity") }),
    );

    lm.register_process("w1").unwrap();
    lm.start("w1").await.unwrap();
    assert_eq!(lm.state("w1"), Some(ProcessState::Starting));
    assert_eq!(lm.stats().hook_failures, 1);
}

#[tokio::test]
async fn test_recovery_action_relaunches_failed_process() {
    let lm = LifecycleManager::new(LifecycleConfig::default().with_recovery(fast_recovery()));
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    lm.set_recovery_action(recovery_action(move |_id| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    running(&lm, "w1").await;
    assert!(lm.mark_failed("w1", "segfault").await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), async {
        while lm.state("w1") != Some(ProcessState::Running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert_eq!(lm.recovery_attempts("w1"), Some(0));
    let path: Vec<ProcessState> = lm.history("w1").iter().map(|t| t.to).collect();
    assert_eq!(
        &path[2..],
        &[
            ProcessState::Failed,
            ProcessState::Recovering,
            ProcessState::Starting,
            ProcessState::Running
        ]
    );
    lm.shutdown().await;
}

#[tokio::test]
async fn test_recovery_disabled_per_process() {
    let lm = LifecycleManager::new(LifecycleConfig::default().with_recovery(fast_recovery()));
    running(&lm, "w1").await;
    lm.set_recovery_enabled("w1", false).unwrap();

    assert!(!lm.mark_failed("w1", "fatal").await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lm.state("w1"), Some(ProcessState::Failed));
    assert_eq!(lm.recovery_attempts("w1"), Some(0));
}

#[tokio::test]
async fn test_failed_recovery_action_counts_attempts() {
    let recovery = RecoveryConfig {
        max_attempts: 2,
        ..fast_recovery()
    };
    let lm = LifecycleManager::new(LifecycleConfig::default().with_recovery(recovery));
    lm.set_recovery_action(recovery_action(|_id| async { anyhow::bail!("binary missing") }));

    running(&lm, "w1").await;
    lm.mark_failed("w1", "crash").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while lm.recovery_attempts("w1") != Some(2) || lm.is_recovering("w1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(lm.state("w1"), Some(ProcessState::Failed));
    assert_eq!(lm.recovery_attempts("w1"), Some(2));

    // A manual start clears the counter
    lm.start("w1").await.unwrap();
    assert_eq!(lm.recovery_attempts("w1"), Some(0));
    lm.shutdown().await;
}

#[tokio::test]
async fn test_unregister_drops_scoped_hooks() {
    let lm = LifecycleManager::new(LifecycleConfig::default());
    lm.register_process("w1").unwrap();
    lm.register_hook(
        LifecycleHook::new("scoped", HookEvent::OnStateChange, hook(|_| async { Ok(()) })).for_process("w1"),
    );
    lm.on(HookEvent::OnStateChange, "global", hook(|_| async { Ok(()) }));

    lm.unregister_process("w1").unwrap();
    assert_eq!(lm.remove_process_hooks("w1"), 0);
    assert!(lm.state("w1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_state_timeout_fails_stuck_start() {
    let timeouts = StateTimeouts {
        starting: Duration::from_secs(2),
        ..StateTimeouts::default()
    };
    let lm = LifecycleManager::new(LifecycleConfig::default().with_timeouts(timeouts));
    lm.register_process("w1").unwrap();
    lm.set_recovery_enabled("w1", false).unwrap();
    lm.start("w1").await.unwrap();

    tokio::time::advance(Duration::from_secs(3)).await;
    let expired = lm.check_timeouts().await;
    assert_eq!(expired, vec![("w1".to_string(), ProcessState::Starting)]);
    assert_eq!(lm.state("w1"), Some(ProcessState::Failed));
    let last = lm.history("w1").pop().unwrap();
    assert_eq!(last.trigger, TransitionTrigger::Timeout);
    assert_ne!(last.metadata, Value::Null);
}

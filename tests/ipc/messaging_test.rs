/*!
 * IPC Messaging Tests
 * Mailbox transport between a supervisor and worker-side managers
 */

use bot_orchestrator::ipc::{handler, Mailbox};
use bot_orchestrator::{IpcConfig, IpcManager, IpcMessage, MessageType, SendOutcome};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn supervisor_with(root: &std::path::Path, workers: &[&str]) -> (IpcManager, Vec<IpcManager>) {
    let config = IpcConfig::with_root(root);
    let supervisor = IpcManager::supervisor(config.clone()).await.unwrap();
    let mut peers = Vec::new();
    for id in workers {
        supervisor.create_channel(id).await.unwrap();
        peers.push(IpcManager::new(config.clone(), *id).await.unwrap());
    }
    (supervisor, peers)
}

#[tokio::test]
async fn test_concurrent_requests_correlate_to_their_callers() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, peers) = supervisor_with(root.path(), &["w1"]).await;
    let worker = &peers[0];
    worker
        .register_handler(
            "w1",
            "echo",
            handler(|msg: IpcMessage| async move { Ok(json!({ "n": msg.payload["n"] })) }),
        )
        .unwrap();
    supervisor.start();
    worker.start();

    let requests = (0..8).map(|n| {
        let supervisor = supervisor.clone();
        async move {
            supervisor
                .request_with_timeout("w1", "echo", json!({ "n": n }), Duration::from_secs(5))
                .await
                .unwrap()
        }
    });
    let outcomes = futures::future::join_all(requests).await;

    for (n, outcome) in outcomes.into_iter().enumerate() {
        assert_eq!(outcome.payload().unwrap()["n"], n);
    }
    assert_eq!(supervisor.stats().responses_correlated, 8);
    assert_eq!(supervisor.pending_requests(), 0);

    supervisor.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_skips_local_and_excluded_channels() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, peers) = supervisor_with(root.path(), &["w1", "w2", "w3"]).await;

    let reached = supervisor
        .broadcast(IpcMessage::event("config_reloaded", json!({})), &["w2"])
        .await
        .unwrap();
    assert_eq!(reached, 2);

    let root_path = root.path();
    let pending: Vec<usize> = futures::future::join_all(
        ["w1", "w2", "w3"]
            .iter()
            .map(|id| async move { Mailbox::new(root_path, id).pending().await.unwrap() }),
    )
    .await;
    assert_eq!(pending, vec![1, 0, 1]);

    for peer in &peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn test_event_handler_runs_without_reply() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, peers) = supervisor_with(root.path(), &["w1"]).await;
    let worker = &peers[0];
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    worker
        .register_handler(
            "w1",
            "config_reloaded",
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        )
        .unwrap();

    let outcome = supervisor
        .send("w1", IpcMessage::event("config_reloaded", json!({})))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Delivered(_)));

    assert_eq!(worker.process_inbox().await.unwrap(), 1);
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // Events never produce a reply in the sender's inbox
    assert_eq!(Mailbox::new(root.path(), "supervisor").pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_heartbeat_is_echoed_once() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, peers) = supervisor_with(root.path(), &["w1"]).await;
    let worker = &peers[0];

    assert_eq!(supervisor.heartbeat().await.unwrap(), 1);
    assert_eq!(worker.process_inbox().await.unwrap(), 1);

    let before = supervisor.last_activity("w1").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(supervisor.process_inbox().await.unwrap(), 1);
    assert!(supervisor.last_activity("w1").unwrap() > before);

    // The echo is not echoed back
    assert_eq!(Mailbox::new(root.path(), "w1").pending().await.unwrap(), 0);
    assert_eq!(supervisor.stats().heartbeats_sent, 1);
}

#[tokio::test]
async fn test_malformed_inbox_file_is_quarantined() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _peers) = supervisor_with(root.path(), &["w1"]).await;
    let inbox = Mailbox::new(root.path(), "supervisor");

    std::fs::write(
        inbox.inbox().join("00000000000000000001-000000000000-garbage.json"),
        b"{\"message_type\": 7",
    )
    .unwrap();

    assert_eq!(supervisor.process_inbox().await.unwrap(), 0);
    assert_eq!(supervisor.stats().messages_quarantined, 1);
    assert_eq!(inbox.quarantined().await.unwrap(), 1);
    assert_eq!(inbox.pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_removed_channel_fails_waiting_request() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _peers) = supervisor_with(root.path(), &["w1"]).await;
    supervisor.start();

    let waiting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .request_with_timeout("w1", "ping", Value::Null, Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(supervisor.remove_channel("w1").await.unwrap());

    let result = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert!(!Mailbox::new(root.path(), "w1").exists().await);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_message_reaches_shutdown_handler() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, peers) = supervisor_with(root.path(), &["w1"]).await;
    let worker = &peers[0];
    worker
        .register_handler(
            "w1",
            "shutdown",
            handler(|msg: IpcMessage| async move {
                assert_eq!(msg.message_type, MessageType::Shutdown);
                Ok(json!({ "acknowledged": msg.payload["graceful"] }))
            }),
        )
        .unwrap();
    supervisor.start();
    worker.start();

    let outcome = supervisor
        .send("w1", IpcMessage::shutdown(true).with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(outcome.payload().unwrap()["acknowledged"], true);

    supervisor.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_idle_channels_are_cleaned_up() {
    let root = tempfile::tempdir().unwrap();
    let config = IpcConfig {
        idle_timeout: Duration::from_millis(40),
        ..IpcConfig::with_root(root.path())
    };
    let supervisor = IpcManager::supervisor(config).await.unwrap();
    supervisor.create_channel("stale").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    supervisor.create_channel("fresh").await.unwrap();

    assert_eq!(supervisor.cleanup_idle().await, vec!["stale".to_string()]);
    assert!(!supervisor.has_channel("stale"));
    assert!(supervisor.has_channel("fresh"));
    assert!(!root.path().join("stale").exists());
    // The supervisor's own mailbox is never reaped
    assert!(root.path().join(supervisor.owner()).exists());
}

#[tokio::test]
async fn test_kept_alive_channels_survive_idle_cleanup() {
    let root = tempfile::tempdir().unwrap();
    let config = IpcConfig {
        idle_timeout: Duration::from_millis(40),
        ..IpcConfig::with_root(root.path())
    };
    let supervisor = IpcManager::supervisor(config).await.unwrap();
    supervisor.create_channel("paused").await.unwrap();
    supervisor.create_channel("gone").await.unwrap();
    supervisor.set_keep_alive(Arc::new(|channel: &str| channel == "paused"));
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(supervisor.cleanup_idle().await, vec!["gone".to_string()]);
    assert!(supervisor.has_channel("paused"));
    assert!(root.path().join("paused").exists());
}

#[tokio::test]
async fn test_uncorrelated_response_is_ignored() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, peers) = supervisor_with(root.path(), &["w1"]).await;
    let worker = &peers[0];
    worker
        .register_handler("w1", "echo", handler(|msg: IpcMessage| async move { Ok(msg.payload) }))
        .unwrap();

    // A real request waits while the worker is not yet processing
    let caller = supervisor.clone();
    let request = tokio::spawn(async move {
        caller
            .send("w1", IpcMessage::command("echo", json!({ "n": 1 })).with_timeout(Duration::from_secs(5)))
            .await
    });
    while supervisor.pending_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut never_sent = IpcMessage::command("echo", Value::Null);
    never_sent.id = uuid::Uuid::new_v4();
    never_sent.sender = supervisor.owner().to_string();
    let mut stray = never_sent.response(json!({ "late": true }));
    stray.sender = "w1".into();
    Mailbox::new(root.path(), "w1")
        .deliver(&Mailbox::new(root.path(), supervisor.owner()), &stray, 1)
        .await
        .unwrap();

    assert_eq!(supervisor.process_inbox().await.unwrap(), 1);
    assert_eq!(supervisor.stats().unknown_replies, 1);
    assert_eq!(supervisor.pending_requests(), 1);

    supervisor.start();
    worker.start();
    let outcome = request.await.unwrap().unwrap();
    assert_eq!(outcome.payload().unwrap()["n"], 1);
    assert_eq!(supervisor.stats().unknown_replies, 1);

    supervisor.shutdown().await;
    worker.shutdown().await;
}

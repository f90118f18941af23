/*!
 * Worker Runtime
 * IPC command surface of a worker process
 *
 * The runtime adopts the mailbox named after the worker, answers `ping`,
 * `status`, `shutdown`, `heartbeat` and `metrics`, and resolves `run` once
 * a shutdown was acknowledged.
 */

use super::behavior::WorkerBehavior;
use crate::core::config::{IpcConfig, WorkerConfig};
use crate::core::limits::SHUTDOWN_ACK_GRACE;
use crate::core::types::{now_micros, OrchestratorResult};
use crate::ipc::{handler, IpcManager, IpcMessage};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct RuntimeInner {
    config: WorkerConfig,
    ipc: IpcManager,
    behavior: Arc<dyn WorkerBehavior>,
    started: Instant,
    commands_handled: AtomicU64,
    /// `Some(graceful)` once shutdown was requested
    shutdown_tx: watch::Sender<Option<bool>>,
}

impl RuntimeInner {
    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_tx.borrow().is_some()
    }
}

/// Worker-side runtime; cheap to clone
#[derive(Clone)]
pub struct WorkerRuntime {
    inner: Arc<RuntimeInner>,
}

impl WorkerRuntime {
    pub async fn new(
        config: WorkerConfig,
        ipc_config: IpcConfig,
        behavior: Arc<dyn WorkerBehavior>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;
        let ipc = IpcManager::new(ipc_config, config.worker_id.clone()).await?;
        let (shutdown_tx, _) = watch::channel(None);

        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                config,
                ipc,
                behavior,
                started: Instant::now(),
                commands_handled: AtomicU64::new(0),
                shutdown_tx,
            }),
        };
        runtime.register_commands()?;
        Ok(runtime)
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn ipc(&self) -> &IpcManager {
        &self.inner.ipc
    }

    pub fn commands_handled(&self) -> u64 {
        self.inner.commands_handled.load(Ordering::Relaxed)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.inner.shutdown_requested()
    }

    /// Ask `run` to return, as the `shutdown` command does
    pub fn request_shutdown(&self, graceful: bool) {
        self.inner.shutdown_tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(graceful);
            true
        });
    }

    fn register_commands(&self) -> OrchestratorResult<()> {
        let ipc = &self.inner.ipc;
        let id = self.worker_id();

        ipc.register_handler(
            id,
            "ping",
            self.command(|rt, _msg| async move {
                Ok(json!({
                    "pong": true,
                    "worker_id": rt.config.worker_id,
                    "uptime_secs": rt.uptime_secs(),
                    "pid": std::process::id(),
                }))
            }),
        )?;

        ipc.register_handler(
            id,
            "status",
            self.command(|rt, _msg| async move {
                Ok(json!({
                    "worker_id": rt.config.worker_id,
                    "running": !rt.shutdown_requested(),
                    "priority": rt.config.priority,
                    "uptime_secs": rt.uptime_secs(),
                    "commands_handled": rt.commands_handled.load(Ordering::Relaxed),
                    "ipc": rt.ipc.stats(),
                }))
            }),
        )?;

        ipc.register_handler(
            id,
            "shutdown",
            self.command(|rt, msg| async move {
                let graceful = msg
                    .payload
                    .get("graceful")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                info!(worker_id = %rt.config.worker_id, graceful, sender = %msg.sender, "Shutdown requested");
                WorkerRuntime { inner: rt.clone() }.request_shutdown(graceful);
                Ok(json!({ "acknowledged": true, "worker_id": rt.config.worker_id }))
            }),
        )?;

        ipc.register_handler(
            id,
            "heartbeat",
            self.command(|rt, _msg| async move {
                Ok(json!({
                    "alive": true,
                    "worker_id": rt.config.worker_id,
                    "timestamp": now_micros(),
                }))
            }),
        )?;

        ipc.register_handler(
            id,
            "metrics",
            self.command(|rt, _msg| async move {
                let mut metrics = match rt.behavior.metrics() {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                metrics.insert("uptime_secs".into(), json!(rt.uptime_secs()));
                metrics.insert(
                    "commands_handled".into(),
                    json!(rt.commands_handled.load(Ordering::Relaxed)),
                );
                Ok(Value::Object(metrics))
            }),
        )?;

        Ok(())
    }

    /// Handler bound to the runtime by weak reference; counts each call
    fn command<F, Fut>(&self, f: F) -> crate::ipc::CommandHandler
    where
        F: Fn(Arc<RuntimeInner>, IpcMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let weak: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        let f = Arc::new(f);
        handler(move |msg| {
            let weak = weak.clone();
            let f = f.clone();
            async move {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("worker runtime dropped"))?;
                inner.commands_handled.fetch_add(1, Ordering::Relaxed);
                f(inner, msg).await
            }
        })
    }

    /// Serve commands until a shutdown is requested
    pub async fn run(&self) -> anyhow::Result<()> {
        self.inner.behavior.on_start(&self.inner.config).await?;
        self.inner.ipc.start();
        info!(
            worker_id = %self.worker_id(),
            pid = std::process::id(),
            priority = %self.inner.config.priority,
            "Worker ready"
        );

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let graceful = loop {
            if let Some(graceful) = *shutdown_rx.borrow_and_update() {
                break graceful;
            }
            if shutdown_rx.changed().await.is_err() {
                break false;
            }
        };

        // The acknowledgement is posted by the delivery task after the handler returns
        tokio::time::sleep(SHUTDOWN_ACK_GRACE).await;

        if let Err(e) = self.inner.behavior.on_shutdown(graceful).await {
            warn!(worker_id = %self.worker_id(), error = %e, "Behavior shutdown failed");
        }
        self.inner.ipc.shutdown().await;
        debug!(worker_id = %self.worker_id(), commands = self.commands_handled(), "Worker runtime stopped");
        Ok(())
    }
}

/*!
 * Background Loop Task
 *
 * Every periodic loop in the orchestrator (IPC delivery, heartbeats, idle
 * cleanup, state timeouts, health monitoring, resource optimization) runs as a
 * `LoopTask`: a spawned task woken by its own interval plus a control channel.
 * Shutdown cancels the loop and awaits it, so no work dangles after teardown.
 */

use super::limits::{LOOP_ERROR_PAUSE, MIN_LOOP_PERIOD};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Control messages for a loop task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    /// Run one tick now, outside the regular schedule
    Trigger,
    /// Stop the loop
    Shutdown,
}

/// Handle to a periodic background loop
pub struct LoopTask {
    name: &'static str,
    command_tx: mpsc::UnboundedSender<LoopCommand>,
    handle: Option<JoinHandle<()>>,
}

impl LoopTask {
    /// Spawn a loop that calls `tick` every `period`
    ///
    /// A tick returning `Err` is logged; the loop pauses briefly and continues.
    /// A zero period is raised to `MIN_LOOP_PERIOD`.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let period = period.max(MIN_LOOP_PERIOD);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(name, period, tick, command_rx));

        debug!(task = name, period_ms = period.as_millis() as u64, "Loop task spawned");

        Self {
            name,
            command_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request an immediate tick
    pub fn trigger(&self) {
        let _ = self.command_tx.send(LoopCommand::Trigger);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        let _ = self.command_tx.send(LoopCommand::Shutdown);

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Loop task ended abnormally");
            } else {
                debug!(task = self.name, "Loop task shutdown complete");
            }
        }
    }
}

async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut tick: F,
    mut command_rx: mpsc::UnboundedReceiver<LoopCommand>,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let run = tokio::select! {
            _ = interval.tick() => true,
            cmd = command_rx.recv() => match cmd {
                Some(LoopCommand::Trigger) => true,
                // Shutdown requested or every handle dropped
                Some(LoopCommand::Shutdown) | None => false,
            },
        };

        if !run {
            info!(task = name, "Loop task stopping");
            break;
        }

        if let Err(e) = tick().await {
            warn!(task = name, error = %e, "Loop tick failed");
            tokio::time::sleep(LOOP_ERROR_PAUSE).await;
        }
    }
}

impl Drop for LoopTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.command_tx.send(LoopCommand::Shutdown);
        }
    }
}

/// Shut down a batch of loops in order
pub async fn shutdown_all(tasks: Vec<LoopTask>) {
    for task in tasks {
        task.shutdown().await;
    }
}

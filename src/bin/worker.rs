/*!
 * Bot Orchestrator - Worker Entry Point
 *
 * Usage: worker <worker_id> <config_json> [ipc_root]
 */

use std::error::Error;
use std::sync::Arc;
use tracing::info;

use bot_orchestrator::{
    init_tracing, wait_for_shutdown_signal, IdleBehavior, IpcConfig, WorkerConfig, WorkerRuntime,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(worker_id), Some(blob)) = (args.next(), args.next()) else {
        return Err("usage: worker <worker_id> <config_json> [ipc_root]".into());
    };
    let ipc_config = match args.next() {
        Some(root) => IpcConfig::with_root(root),
        None => IpcConfig::default(),
    };

    let mut config = WorkerConfig::from_blob(&blob)?;
    config.worker_id = worker_id;

    let runtime = WorkerRuntime::new(config, ipc_config, Arc::new(IdleBehavior)).await?;
    info!(worker_id = %runtime.worker_id(), "Worker process started");

    let run = runtime.run();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result?,
        signal = wait_for_shutdown_signal() => {
            info!(worker_id = %runtime.worker_id(), signal = signal?, "Signal received; exiting");
            runtime.request_shutdown(false);
            run.await?;
        }
    }

    info!(worker_id = %runtime.worker_id(), commands = runtime.commands_handled(), "Worker process exiting");
    Ok(())
}

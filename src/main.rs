/*!
 * Bot Orchestrator - Supervisor Entry Point
 *
 * Starts the supervisor, creates and starts the configured workers, then
 * waits for a shutdown signal and stops the fleet within the configured
 * deadline.
 */

use std::error::Error;
use tracing::{error, info, warn};

use bot_orchestrator::{init_tracing, wait_for_shutdown_signal, Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    info!("Bot orchestrator starting...");
    info!("================================================");

    let config = OrchestratorConfig::from_env()?;
    info!(
        ipc_root = %config.ipc.root.display(),
        worker_program = %config.worker_program.display(),
        max_workers = config.max_workers,
        workers = config.workers.len(),
        "Configuration loaded"
    );

    let orchestrator = Orchestrator::new(config.clone()).await?;
    orchestrator.start_monitoring();

    for worker in &config.workers {
        let id = worker.worker_id.clone();
        if let Err(e) = orchestrator.create(&id, worker.clone()).await {
            error!(worker_id = %id, error = %e, "Could not create worker");
            continue;
        }
        match orchestrator.start(&id).await {
            Ok(()) => info!(worker_id = %id, "Worker running"),
            Err(e) => warn!(worker_id = %id, error = %e, "Worker failed to start"),
        }
    }

    info!("Orchestrator initialization complete");
    info!("================================================");
    info!("Press Ctrl+C to exit");

    let signal = wait_for_shutdown_signal().await?;
    info!(signal, "Shutdown signal received");

    let report = orchestrator.shutdown_all(config.shutdown_timeout).await;
    info!(
        stopped = report.stopped,
        forced = report.forced,
        "Orchestrator stopped"
    );
    Ok(())
}

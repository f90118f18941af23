/*!
 * Bot Orchestrator Library
 * Supervises a fleet of worker processes over file-backed message passing
 */

pub mod core;
pub mod ipc;
pub mod monitoring;
pub mod orchestrator;
pub mod process;
pub mod resources;
pub mod worker;

// Re-exports
pub use crate::core::{
    wait_for_shutdown_signal, CommandError, IpcConfig, IpcError, LifecycleError, OrchestratorConfig,
    OrchestratorError, OrchestratorResult, Priority, ProcessId, ResourceError, RestartPolicy,
    WorkerConfig,
};
pub use ipc::{IpcManager, IpcMessage, MessageType, SendOutcome};
pub use monitoring::{init_tracing, MetricsCollector, ProcessMonitor};
pub use orchestrator::{CommandRegistry, CommandResult, Orchestrator, Permission, ShutdownReport, WorkerInfo};
pub use process::{LifecycleManager, ProcessState, TransitionTrigger};
pub use resources::{AllocationStrategy, ResourceAllocator, ResourceLimits};
pub use worker::{IdleBehavior, WorkerBehavior, WorkerRuntime};

/*!
 * Core Module
 * Fundamental types, configuration, error handling and background loops
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod signals;
pub mod task;
pub mod types;

// Re-export for convenience
pub use config::{
    Credentials, IpcConfig, OrchestratorConfig, RecoveryConfig, RestartPolicy, StateTimeouts,
    WorkerConfig,
};
pub use errors::*;
pub use signals::wait_for_shutdown_signal;
pub use task::{LoopCommand, LoopTask};
pub use types::*;

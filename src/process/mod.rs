/*!
 * Process Module
 * Worker lifecycle state machine and OS process execution
 */

pub mod executor;
pub mod lifecycle;
pub mod types;

// Re-export for convenience
pub use executor::{ExecutionConfig, ProcessExecutor, ProcessSignal, WorkerProcess};
pub use lifecycle::{
    hook, recovery_action, HookContext, HookEvent, HookHandler, LifecycleConfig, LifecycleHook,
    LifecycleManager, RecoveryAction,
};
pub use types::{
    HealthInfo, LifecycleStats, ProcessSnapshot, ProcessState, StateTransition, TransitionTrigger,
};

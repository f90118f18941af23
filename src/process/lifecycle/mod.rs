/*!
 * Process Lifecycle Management
 * State machine, hooks, health checks, timeouts and automated recovery
 */

mod health;
pub mod hooks;
pub mod manager;
mod recovery;
mod timeouts;

// Re-export public types
pub use hooks::{hook, HookContext, HookEvent, HookHandler, HookRegistry, LifecycleHook};
pub use manager::{recovery_action, LifecycleConfig, LifecycleManager, RecoveryAction};

/*!
 * Orchestrator Module
 * Fleet supervisor, stop escalation and the administrative command surface
 */

pub mod commands;
mod hooks;
mod stop;
mod supervisor;
pub mod types;

pub use commands::{
    command_fn, CommandArgs, CommandFn, CommandRegistry, CommandResult, CommandScope, CommandSpec,
    ParamSpec, ParamType, Permission,
};
pub use supervisor::Orchestrator;
pub use types::{ConfigSource, FleetStats, ShutdownReport, StaticConfigSource, StopOutcome, WorkerInfo};

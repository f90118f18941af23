/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use crate::core::types::ProcessId;
use crate::process::types::ProcessState;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// IPC transport errors
///
/// A request that simply got no answer is not an error; see `SendOutcome::Timeout`.
#[derive(Error, Debug, Diagnostic)]
pub enum IpcError {
    #[error("Channel {0} not found")]
    #[diagnostic(
        code(ipc::channel_not_found),
        help("Create the channel before sending to it, or check that the worker is registered.")
    )]
    ChannelNotFound(String),

    #[error("Channel {0} is not owned by this manager")]
    #[diagnostic(
        code(ipc::not_local),
        help("Handlers can only be registered on the manager's own channel.")
    )]
    NotLocal(String),

    #[error("Mailbox I/O failed at {path}: {source}")]
    #[diagnostic(code(ipc::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Message serialization failed: {0}")]
    #[diagnostic(code(ipc::serialization))]
    Serialization(#[from] serde_json::Error),

    #[error("IPC manager is shut down")]
    #[diagnostic(code(ipc::closed))]
    Closed,
}

impl IpcError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IpcError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type IpcResult<T> = Result<T, IpcError>;

/// Lifecycle state machine errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum LifecycleError {
    #[error("Process {0} is not registered")]
    #[diagnostic(code(lifecycle::not_registered))]
    NotRegistered(ProcessId),

    #[error("Process {0} is already registered")]
    #[diagnostic(code(lifecycle::already_registered))]
    AlreadyRegistered(ProcessId),

    #[error("Invalid transition for {process_id}: {from:?} -> {to:?}")]
    #[diagnostic(
        code(lifecycle::invalid_transition),
        help("The requested state is not reachable from the current state.")
    )]
    InvalidTransition {
        process_id: ProcessId,
        from: ProcessState,
        to: ProcessState,
    },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Resource allocation errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ResourceError {
    #[error("Process {0} already holds an allocation")]
    #[diagnostic(code(resources::already_allocated))]
    AlreadyAllocated(ProcessId),

    #[error("Process {0} holds no allocation")]
    #[diagnostic(code(resources::not_allocated))]
    NotAllocated(ProcessId),

    #[error("Invalid limits for {process_id}: {reason}")]
    #[diagnostic(code(resources::invalid_limits))]
    InvalidLimits {
        process_id: ProcessId,
        reason: String,
    },

    #[error("Allocation for {process_id} is infeasible: {reason}")]
    #[diagnostic(
        code(resources::infeasible),
        help("The global ceiling is exhausted even for a reduced grant. Stop or shrink other workers.")
    )]
    Infeasible {
        process_id: ProcessId,
        reason: String,
    },
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// Supervisor-level errors
#[derive(Error, Debug, Diagnostic)]
pub enum OrchestratorError {
    #[error("Admission denied for {process_id}: {reason}")]
    #[diagnostic(
        code(orchestrator::admission_denied),
        help("Fleet ceilings (worker count, memory, CPU) would be exceeded.")
    )]
    AdmissionDenied {
        process_id: ProcessId,
        reason: String,
    },

    #[error("Worker {0} already exists")]
    #[diagnostic(code(orchestrator::worker_exists))]
    WorkerExists(ProcessId),

    #[error("Worker {0} not found")]
    #[diagnostic(code(orchestrator::worker_not_found))]
    WorkerNotFound(ProcessId),

    #[error("Failed to spawn worker {process_id}: {reason}")]
    #[diagnostic(
        code(orchestrator::spawn_failed),
        help("Check `worker_program` in the configuration and its permissions.")
    )]
    SpawnFailed {
        process_id: ProcessId,
        reason: String,
    },

    #[error("Worker {process_id} did not answer ping within {timeout_ms}ms")]
    #[diagnostic(code(orchestrator::startup_failed))]
    StartupFailed {
        process_id: ProcessId,
        timeout_ms: u64,
    },

    #[error("Could not deliver {signal} to worker {process_id}")]
    #[diagnostic(code(orchestrator::signal_failed))]
    SignalFailed {
        process_id: ProcessId,
        signal: String,
    },

    #[error("Configuration error: {0}")]
    #[diagnostic(code(orchestrator::config))]
    Config(String),

    #[error("Lifecycle error: {0}")]
    #[diagnostic(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Resource error: {0}")]
    #[diagnostic(transparent)]
    Resource(#[from] ResourceError),

    #[error("IPC error: {0}")]
    #[diagnostic(transparent)]
    Ipc(#[from] IpcError),
}

impl OrchestratorError {
    /// Short stable label for logs and metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            OrchestratorError::AdmissionDenied { .. } => "admission_denied",
            OrchestratorError::WorkerExists(_) => "worker_exists",
            OrchestratorError::WorkerNotFound(_) => "worker_not_found",
            OrchestratorError::SpawnFailed { .. } => "spawn_failed",
            OrchestratorError::StartupFailed { .. } => "startup_failed",
            OrchestratorError::SignalFailed { .. } => "signal_failed",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Lifecycle(_) => "lifecycle",
            OrchestratorError::Resource(_) => "resource",
            OrchestratorError::Ipc(_) => "ipc",
        }
    }
}

/// Administrative command errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    #[diagnostic(code(command::unknown))]
    UnknownCommand(String),

    #[error("Permission denied for {command}: missing {missing}")]
    #[diagnostic(code(command::permission_denied))]
    PermissionDenied { command: String, missing: String },

    #[error("Missing required parameter: {0}")]
    #[diagnostic(code(command::missing_parameter))]
    MissingParameter(String),

    #[error("Invalid parameter {name}: expected {expected}")]
    #[diagnostic(code(command::invalid_parameter))]
    InvalidParameter { name: String, expected: String },

    #[error("Command failed: {0}")]
    #[diagnostic(code(command::execution_failed))]
    ExecutionFailed(String),

    #[error("Worker {worker_id} rejected {command}: {error}")]
    #[diagnostic(code(command::worker_error))]
    WorkerError {
        worker_id: String,
        command: String,
        error: String,
    },

    #[error("No response from worker {worker_id} to {command} within {timeout_ms} ms")]
    #[diagnostic(
        code(command::no_response),
        help("The worker may be paused, busy or gone; the command may still run.")
    )]
    NoResponse {
        worker_id: String,
        command: String,
        timeout_ms: u64,
    },
}

/*!
 * Administrative Commands
 * Typed registry of operator commands dispatched against the orchestrator
 *
 * Each command declares its scope, the permissions it requires and a
 * parameter schema. Execution checks permissions and parameter types before
 * the handler runs, and always returns a `CommandResult`.
 */

use super::supervisor::Orchestrator;
use crate::core::config::WorkerConfig;
use crate::core::errors::CommandError;
use crate::ipc::{IpcMessage, SendOutcome};
use crate::process::ProcessState;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What a command operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandScope {
    Global,
    Process,
    Worker,
    Connection,
}

/// Capability a caller must hold to run a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Control,
    Admin,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Control => "control",
            Permission::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
        }
    }

    /// Integers are accepted where a float is expected
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// Command descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub category: String,
    pub scope: CommandScope,
    pub permissions: BTreeSet<Permission>,
    pub params: Vec<ParamSpec>,
}

impl CommandSpec {
    pub fn new(name: &str, category: &str, scope: CommandScope, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            scope,
            permissions: BTreeSet::new(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn requires(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    #[must_use]
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Check the caller's permissions, then every declared parameter
    pub fn validate(&self, params: &Map<String, Value>, granted: &[Permission]) -> Result<(), CommandError> {
        if let Some(missing) = self.permissions.iter().find(|p| !granted.contains(p)) {
            return Err(CommandError::PermissionDenied {
                command: self.name.clone(),
                missing: missing.as_str().to_string(),
            });
        }

        for spec in &self.params {
            match params.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(CommandError::MissingParameter(spec.name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.param_type.accepts(value) => {
                    return Err(CommandError::InvalidParameter {
                        name: spec.name.clone(),
                        expected: spec.param_type.as_str().to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Validated command parameters
#[derive(Debug, Clone, Default)]
pub struct CommandArgs(Map<String, Value>);

impl CommandArgs {
    pub fn new(params: Map<String, Value>) -> Self {
        Self(params)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    pub fn str(&self, name: &str) -> Result<&str, CommandError> {
        self.get(name)
            .ok_or_else(|| CommandError::MissingParameter(name.to_string()))?
            .as_str()
            .ok_or_else(|| CommandError::InvalidParameter {
                name: name.to_string(),
                expected: "string".into(),
            })
    }

    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn u64_or(&self, name: &str, default: u64) -> u64 {
        self.get(name).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }
}

pub type CommandFuture = BoxFuture<'static, Result<Value, CommandError>>;
pub type CommandFn = Arc<dyn Fn(Orchestrator, CommandArgs) -> CommandFuture + Send + Sync>;

/// Wrap an async closure as a `CommandFn`
pub fn command_fn<F, Fut>(f: F) -> CommandFn
where
    F: Fn(Orchestrator, CommandArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
{
    Arc::new(move |orch, args| Box::pin(f(orch, args)))
}

/// Uniform command outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

struct RegisteredCommand {
    spec: CommandSpec,
    handler: CommandFn,
}

/// Registry of administrative commands
pub struct CommandRegistry {
    commands: HashMap<String, RegisteredCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Registry holding the built-in fleet commands
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    /// Register or replace a command
    pub fn register(&mut self, spec: CommandSpec, handler: CommandFn) {
        self.commands
            .insert(spec.name.clone(), RegisteredCommand { spec, handler });
    }

    pub fn spec(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name).map(|c| &c.spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Every descriptor, sorted by name
    pub fn specs(&self) -> Vec<&CommandSpec> {
        let mut specs: Vec<&CommandSpec> = self.commands.values().map(|c| &c.spec).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn by_category(&self, category: &str) -> Vec<&CommandSpec> {
        self.specs()
            .into_iter()
            .filter(|s| s.category == category)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Validate and run `name`; failures come back in the result
    pub async fn execute(
        &self,
        orchestrator: &Orchestrator,
        name: &str,
        params: Value,
        granted: &[Permission],
    ) -> CommandResult {
        let started = Instant::now();
        let outcome = self.dispatch(orchestrator, name, params, granted).await;
        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(data) => {
                info!(command = %name, elapsed_ms = execution_time_ms, "Command executed");
                CommandResult {
                    command: name.to_string(),
                    success: true,
                    data,
                    error: None,
                    execution_time_ms,
                }
            }
            Err(e) => {
                warn!(command = %name, error = %e, "Command failed");
                CommandResult {
                    command: name.to_string(),
                    success: false,
                    data: Value::Null,
                    error: Some(e.to_string()),
                    execution_time_ms,
                }
            }
        }
    }

    async fn dispatch(
        &self,
        orchestrator: &Orchestrator,
        name: &str,
        params: Value,
        granted: &[Permission],
    ) -> Result<Value, CommandError> {
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;

        let params = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => {
                return Err(CommandError::InvalidParameter {
                    name: "params".into(),
                    expected: "object".into(),
                })
            }
        };
        command.spec.validate(&params, granted)?;

        (command.handler)(orchestrator.clone(), CommandArgs::new(params)).await
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn failed(e: impl std::fmt::Display) -> CommandError {
    CommandError::ExecutionFailed(e.to_string())
}

fn to_value<T: Serialize>(value: T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(failed)
}

const WORKER_ID: &str = "worker_id";

fn worker_param() -> ParamSpec {
    ParamSpec::required(WORKER_ID, ParamType::String, "Target worker")
}

fn register_defaults(registry: &mut CommandRegistry) {
    use CommandScope::*;
    use Permission::*;

    registry.register(
        CommandSpec::new("list_workers", "fleet", Global, "List every supervised worker")
            .requires(Read)
            .param(ParamSpec::optional("state", ParamType::String, "Only workers in this state")),
        command_fn(|orch, args| async move {
            let state = args.opt_str("state").map(str::to_ascii_uppercase);
            let workers: Vec<_> = orch
                .list_workers()
                .into_iter()
                .filter(|w| state.as_deref().map_or(true, |s| w.state.as_str() == s))
                .collect();
            to_value(workers)
        }),
    );

    registry.register(
        CommandSpec::new("worker_status", "worker", Worker, "State, health and allocation of one worker")
            .requires(Read)
            .param(worker_param()),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?;
            let info = orch
                .worker_info(id)
                .ok_or_else(|| failed(format!("worker {} not found", id)))?;
            to_value(info)
        }),
    );

    registry.register(
        CommandSpec::new("create_worker", "worker", Worker, "Admit and register a new worker")
            .requires(Control)
            .param(worker_param())
            .param(ParamSpec::optional("config", ParamType::Object, "Worker configuration"))
            .param(ParamSpec::optional("start", ParamType::Boolean, "Start right after creation")),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?.to_string();
            let config = match args.get("config") {
                Some(raw) => serde_json::from_value::<WorkerConfig>(raw.clone()).map_err(|e| {
                    CommandError::InvalidParameter {
                        name: "config".into(),
                        expected: format!("worker configuration ({})", e),
                    }
                })?,
                None => WorkerConfig::new(id.as_str()),
            };
            orch.create(&id, config).await.map_err(failed)?;
            if args.bool_or("start", false) {
                orch.start(&id).await.map_err(failed)?;
            }
            Ok(json!({ WORKER_ID: id, "state": orch.lifecycle().state(&id) }))
        }),
    );

    registry.register(
        CommandSpec::new("start_worker", "worker", Process, "Launch a worker process")
            .requires(Control)
            .param(worker_param()),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?;
            orch.start(id).await.map_err(failed)?;
            Ok(json!({ WORKER_ID: id, "state": ProcessState::Running }))
        }),
    );

    registry.register(
        CommandSpec::new("stop_worker", "worker", Process, "Stop a worker process")
            .requires(Control)
            .param(worker_param())
            .param(ParamSpec::optional("graceful", ParamType::Boolean, "Ask the worker to exit first"))
            .param(ParamSpec::optional("timeout_ms", ParamType::Integer, "Graceful stop timeout")),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?;
            let graceful = args.bool_or("graceful", true);
            let timeout = args
                .get("timeout_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis)
                .unwrap_or(orch.config().stop_timeout);
            let exited = orch
                .stop_with_timeout(id, graceful, timeout)
                .await
                .map_err(failed)?;
            Ok(json!({ WORKER_ID: id, "exited": exited }))
        }),
    );

    registry.register(
        CommandSpec::new("restart_worker", "worker", Process, "Replace a worker's process")
            .requires(Control)
            .param(worker_param()),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?;
            orch.restart(id).await.map_err(failed)?;
            let restarts = orch.worker_info(id).map_or(0, |w| w.restarts);
            Ok(json!({ WORKER_ID: id, "restarts": restarts }))
        }),
    );

    registry.register(
        CommandSpec::new("destroy_worker", "worker", Worker, "Stop and forget a worker")
            .requires(Control)
            .requires(Admin)
            .param(worker_param()),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?;
            orch.destroy(id).await.map_err(failed)?;
            Ok(json!({ WORKER_ID: id, "destroyed": true }))
        }),
    );

    registry.register(
        CommandSpec::new("fleet_stats", "fleet", Global, "Aggregate fleet statistics").requires(Read),
        command_fn(|orch, _args| async move { to_value(orch.stats()) }),
    );

    registry.register(
        CommandSpec::new("allocations", "resources", Global, "Current resource grants and utilization")
            .requires(Read),
        command_fn(|orch, _args| async move {
            let allocator = orch.allocator();
            Ok(json!({
                "strategy": allocator.strategy(),
                "capacity": allocator.capacity(),
                "allocated": allocator.total_allocated(),
                "available": allocator.available(),
                "allocations": allocator.allocations(),
            }))
        }),
    );

    registry.register(
        CommandSpec::new("transition_history", "worker", Worker, "Recent state transitions of a worker")
            .requires(Read)
            .param(worker_param())
            .param(ParamSpec::optional("limit", ParamType::Integer, "Newest entries to return")),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?;
            if !orch.has_worker(id) {
                return Err(failed(format!("worker {} not found", id)));
            }
            let history = orch.lifecycle().history(id);
            let limit = args.u64_or("limit", history.len() as u64) as usize;
            let start = history.len().saturating_sub(limit);
            to_value(&history[start..])
        }),
    );

    registry.register(
        CommandSpec::new("optimize_resources", "resources", Global, "Run one reallocation pass now")
            .requires(Control),
        command_fn(|orch, _args| async move { to_value(orch.allocator().optimize()) }),
    );

    registry.register(
        CommandSpec::new("worker_command", "worker", Connection, "Forward a command to one worker and await its reply")
            .requires(Control)
            .param(worker_param())
            .param(ParamSpec::required("command", ParamType::String, "Command registered by the worker"))
            .param(ParamSpec::optional("payload", ParamType::Object, "Command payload"))
            .param(ParamSpec::optional("timeout_ms", ParamType::Integer, "Reply timeout")),
        command_fn(|orch, args| async move {
            let id = args.str(WORKER_ID)?.to_string();
            if !orch.has_worker(&id) {
                return Err(failed(format!("worker {} not found", id)));
            }
            let command = args.str("command")?.to_string();
            let payload = args.get("payload").cloned().unwrap_or_else(|| json!({}));
            let timeout = args
                .get("timeout_ms")
                .and_then(Value::as_u64)
                .map_or(orch.config().ipc.default_timeout, Duration::from_millis);

            let outcome = orch
                .ipc()
                .send(&id, IpcMessage::command(command.as_str(), payload).with_timeout(timeout))
                .await
                .map_err(failed)?;
            match outcome {
                SendOutcome::Response(reply) => Ok(json!({
                    "worker_id": id,
                    "command": command,
                    "response": reply.payload,
                })),
                SendOutcome::Remote { error, .. } => Err(CommandError::WorkerError {
                    worker_id: id,
                    command,
                    error,
                }),
                SendOutcome::Timeout => Err(CommandError::NoResponse {
                    worker_id: id,
                    command,
                    timeout_ms: timeout.as_millis() as u64,
                }),
                SendOutcome::Delivered(_) => Ok(json!({ "worker_id": id, "command": command, "response": Value::Null })),
            }
        }),
    );

    registry.register(
        CommandSpec::new("broadcast", "fleet", Connection, "Send an event to every worker")
            .requires(Control)
            .param(ParamSpec::required("event", ParamType::String, "Event name"))
            .param(ParamSpec::optional("payload", ParamType::Object, "Event payload")),
        command_fn(|orch, args| async move {
            let event = args.str("event")?;
            let payload = args.get("payload").cloned().unwrap_or_else(|| json!({}));
            let delivered = orch
                .ipc()
                .broadcast(IpcMessage::event(event, payload), &[])
                .await
                .map_err(failed)?;
            Ok(json!({ "event": event, "delivered": delivered }))
        }),
    );
}

/*!
 * Lifecycle Hooks
 * Prioritized async callbacks bound to lifecycle events
 *
 * Hooks for one event run in descending priority order (registration order
 * breaks ties). A hook returning `Err` is logged and counted; it never
 * blocks the transition that fired it. Hooks run while the process's
 * transition lock is held, so a hook must not transition its own process.
 */

use crate::core::types::ProcessId;
use crate::process::types::{ProcessState, TransitionTrigger};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle event a hook can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
    BeforePause,
    AfterPause,
    BeforeResume,
    AfterResume,
    BeforeRestart,
    AfterRestart,
    OnFailure,
    OnRecovery,
    OnHealthCheck,
    OnStateChange,
}

impl HookEvent {
    /// Event fired before entering `to`
    pub fn before(to: ProcessState) -> Option<HookEvent> {
        match to {
            ProcessState::Starting => Some(HookEvent::BeforeStart),
            ProcessState::Stopping => Some(HookEvent::BeforeStop),
            ProcessState::Pausing => Some(HookEvent::BeforePause),
            ProcessState::Resuming => Some(HookEvent::BeforeResume),
            ProcessState::Restarting => Some(HookEvent::BeforeRestart),
            _ => None,
        }
    }

    /// Event fired after `from -> to` completed
    pub fn after(from: ProcessState, to: ProcessState) -> Option<HookEvent> {
        match (from, to) {
            (ProcessState::Starting, ProcessState::Running) => Some(HookEvent::AfterStart),
            (ProcessState::Stopping, ProcessState::Stopped) => Some(HookEvent::AfterStop),
            (ProcessState::Pausing, ProcessState::Paused) => Some(HookEvent::AfterPause),
            (ProcessState::Resuming, ProcessState::Running) => Some(HookEvent::AfterResume),
            (_, ProcessState::Failed) => Some(HookEvent::OnFailure),
            _ => None,
        }
    }
}

/// Data passed to every hook invocation
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub process_id: ProcessId,
    pub event: HookEvent,
    pub from: ProcessState,
    pub to: ProcessState,
    pub trigger: TransitionTrigger,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type HookHandler = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Wrap an async closure as a `HookHandler`
pub fn hook<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Registered hook
#[derive(Clone)]
pub struct LifecycleHook {
    pub id: Uuid,
    pub name: String,
    pub event: HookEvent,
    /// `None` applies to every process
    pub scope: Option<ProcessId>,
    pub priority: i32,
    pub enabled: bool,
    handler: HookHandler,
}

impl LifecycleHook {
    pub fn new(name: impl Into<String>, event: HookEvent, handler: HookHandler) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            event,
            scope: None,
            priority: 0,
            enabled: true,
            handler,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn for_process(mut self, process_id: impl Into<ProcessId>) -> Self {
        self.scope = Some(process_id.into());
        self
    }

    fn applies_to(&self, event: HookEvent, process_id: &str) -> bool {
        self.enabled
            && self.event == event
            && self.scope.as_deref().map_or(true, |scope| scope == process_id)
    }
}

impl std::fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHook")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("event", &self.event)
            .field("scope", &self.scope)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Hook table owned by the lifecycle manager
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<LifecycleHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: LifecycleHook) -> Uuid {
        let id = hook.id;
        debug!(hook = %hook.name, event = ?hook.event, scope = ?hook.scope, priority = hook.priority, "Hook registered");
        self.hooks.write().push(hook);
        id
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        match self.hooks.write().iter_mut().find(|h| h.id == id) {
            Some(hook) => {
                hook.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Drop every hook scoped to `process_id`
    pub fn remove_process_hooks(&self, process_id: &str) -> usize {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.scope.as_deref() != Some(process_id));
        before - hooks.len()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Enabled hooks for `event` and `process_id`, highest priority first
    pub fn matching(&self, event: HookEvent, process_id: &str) -> Vec<LifecycleHook> {
        let mut matched: Vec<LifecycleHook> = self
            .hooks
            .read()
            .iter()
            .filter(|h| h.applies_to(event, process_id))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }

    /// Run every matching hook in order; returns the number that failed
    pub async fn run(&self, ctx: &HookContext) -> usize {
        let mut failures = 0;
        for hook in self.matching(ctx.event, &ctx.process_id) {
            if let Err(e) = (hook.handler)(ctx.clone()).await {
                failures += 1;
                warn!(
                    hook = %hook.name,
                    event = ?ctx.event,
                    process_id = %ctx.process_id,
                    error = %e,
                    "Lifecycle hook failed"
                );
            }
        }
        failures
    }
}

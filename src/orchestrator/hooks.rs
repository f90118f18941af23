/*!
 * Supervisor Hooks
 * Couples lifecycle transitions to resources, monitoring and recovery
 *
 * Hooks run while the lifecycle manager holds the per-process lock, so
 * none of them may transition their own process.
 */

use super::supervisor::{Orchestrator, OrchestratorInner};
use crate::core::errors::ResourceError;
use crate::process::{
    hook, recovery_action, HookContext, HookEvent, HookHandler, LifecycleHook, ProcessState,
};
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Resource reservation runs before any user hook at the same event
const SUPERVISOR_HOOK_PRIORITY: i32 = 100;

/// Bind a hook body to the supervisor without keeping it alive
fn bound<F, Fut>(weak: Weak<OrchestratorInner>, f: F) -> HookHandler
where
    F: Fn(Orchestrator, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    hook(move |ctx| {
        let weak = weak.clone();
        let f = f.clone();
        async move {
            match weak.upgrade() {
                Some(inner) => f(Orchestrator { inner }, ctx).await,
                None => Ok(()),
            }
        }
    })
}

impl Orchestrator {
    /// Relaunch hook for the lifecycle manager's recovery cycle
    pub(super) fn install_recovery_action(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .lifecycle
            .set_recovery_action(recovery_action(move |worker_id| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        anyhow::bail!("orchestrator dropped");
                    };
                    let orchestrator = Orchestrator { inner };
                    orchestrator.inner.metrics.inc_counter("workers.recovered", 1.0);
                    orchestrator.launch(&worker_id).await?;
                    Ok(())
                }
            }));
    }

    /// Idle cleanup leaves the channels of paused workers alone
    pub(super) fn install_channel_keep_alive(&self) {
        let lifecycle = self.inner.lifecycle.clone();
        self.inner.ipc.set_keep_alive(Arc::new(move |channel: &str| {
            matches!(
                lifecycle.state(channel),
                Some(ProcessState::Pausing | ProcessState::Paused | ProcessState::Resuming)
            )
        }));
    }

    /// Scoped hooks for one worker; unregistering the process drops them
    pub(super) fn wire_hooks(&self, worker_id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let lifecycle = &self.inner.lifecycle;

        lifecycle.register_hook(
            LifecycleHook::new(
                "reserve-resources",
                HookEvent::BeforeStart,
                bound(weak.clone(), |orch, ctx| async move { orch.reserve(&ctx.process_id) }),
            )
            .for_process(worker_id)
            .with_priority(SUPERVISOR_HOOK_PRIORITY),
        );

        lifecycle.register_hook(
            LifecycleHook::new(
                "register-monitor",
                HookEvent::AfterStart,
                bound(weak.clone(), |orch, ctx| async move {
                    orch.watch(&ctx.process_id);
                    Ok(())
                }),
            )
            .for_process(worker_id),
        );

        lifecycle.register_hook(
            LifecycleHook::new(
                "release-resources",
                HookEvent::AfterStop,
                bound(weak.clone(), |orch, ctx| async move { orch.release(&ctx.process_id) }),
            )
            .for_process(worker_id),
        );

        lifecycle.register_hook(
            LifecycleHook::new(
                "record-failure",
                HookEvent::OnFailure,
                bound(weak, |orch, ctx| async move {
                    orch.record_failure(&ctx);
                    Ok(())
                }),
            )
            .for_process(worker_id)
            .with_priority(SUPERVISOR_HOOK_PRIORITY),
        );
    }

    /// Materialize the run's configuration and reserve its resources
    fn reserve(&self, worker_id: &str) -> anyhow::Result<()> {
        let materialized = {
            let record = self
                .inner
                .workers
                .get(worker_id)
                .ok_or_else(|| anyhow::anyhow!("worker {} not found", worker_id))?;
            let mut config = self.inner.config_source.materialize(worker_id, &record.config)?;
            config.worker_id = worker_id.to_string();
            config.validate()?;
            config
        };

        let (priority, limits) = (materialized.priority, materialized.resource_limits);
        if let Some(mut record) = self.inner.workers.get_mut(worker_id) {
            record.materialized = Some(materialized);
        }

        if !self.inner.allocator.has_allocation(worker_id) {
            let allocation = self.inner.allocator.allocate(worker_id, priority, limits)?;
            debug!(
                worker_id = %worker_id,
                memory_mb = allocation.limits.memory_mb,
                cpu_percent = allocation.limits.cpu_percent,
                "Resources reserved"
            );
        }
        Ok(())
    }

    fn watch(&self, worker_id: &str) {
        let Some(os_pid) = self.inner.executor.os_pid(worker_id) else {
            return;
        };
        self.inner.monitor.register(worker_id, os_pid);
        self.inner.monitor.sample(worker_id);
        if let Some(usage) = self.inner.monitor.usage(worker_id) {
            if let Err(e) = self.inner.allocator.record_usage(worker_id, usage) {
                debug!(worker_id = %worker_id, error = %e, "Initial usage not recorded");
            }
        }
    }

    fn release(&self, worker_id: &str) -> anyhow::Result<()> {
        self.inner.monitor.unregister(worker_id);
        if let Some(mut record) = self.inner.workers.get_mut(worker_id) {
            record.materialized = None;
        }
        match self.inner.allocator.deallocate(worker_id) {
            Ok(allocation) => {
                info!(
                    worker_id = %worker_id,
                    memory_mb = allocation.limits.memory_mb,
                    "Resources released"
                );
                Ok(())
            }
            Err(ResourceError::NotAllocated(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_failure(&self, ctx: &HookContext) {
        let worker_id = &ctx.process_id;
        self.inner.monitor.unregister(worker_id);

        let policy = self.restart_policy(worker_id);
        if let Err(e) = self
            .inner
            .lifecycle
            .set_recovery_enabled(worker_id, policy.recovers_failures())
        {
            debug!(worker_id = %worker_id, error = %e, "Could not apply restart policy");
        }

        if policy.recovers_failures() {
            self.inner.metrics.inc_counter("workers.failed", 1.0);
        } else {
            self.inner.metrics.inc_counter("workers.fatal", 1.0);
        }
        warn!(
            worker_id = %worker_id,
            from = %ctx.from,
            error = ctx.error.as_deref().unwrap_or("unknown"),
            restart_policy = ?policy,
            "Worker entered FAILED"
        );
    }
}

/*!
 * Worker Behavior
 * Seam where a worker's business logic plugs into the runtime
 */

use crate::core::config::WorkerConfig;
use futures::future::{self, BoxFuture};
use serde_json::{json, Value};

/// Business logic hosted by a worker process
///
/// The runtime owns the IPC surface; a behavior only reacts to start and
/// shutdown and contributes to the `metrics` reply.
pub trait WorkerBehavior: Send + Sync {
    fn on_start<'a>(&'a self, _config: &'a WorkerConfig) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    fn on_shutdown(&self, _graceful: bool) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(future::ready(Ok(())))
    }

    /// Figures the supervisor cannot sample from the OS
    ///
    /// Recognized keys: `network_mbps`, `connections`, `threads`.
    fn metrics(&self) -> Value {
        json!({})
    }
}

/// Does nothing between start and shutdown
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleBehavior;

impl WorkerBehavior for IdleBehavior {
    fn metrics(&self) -> Value {
        json!({ "network_mbps": 0.0, "connections": 0, "threads": 1 })
    }
}

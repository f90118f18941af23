/*!
 * Command Handlers
 * Async handlers bound to command names on the local channel
 */

use super::types::IpcMessage;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Handler for one command name
///
/// `Ok(value)` becomes a RESPONSE carrying `value`; `Err(e)` becomes an
/// ERROR reply with the error text.
pub type CommandHandler = Arc<dyn Fn(IpcMessage) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a `CommandHandler`
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(IpcMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

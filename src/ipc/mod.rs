/*!
 * IPC Module
 * Point-to-point messaging between the supervisor and its workers over
 * file-backed mailboxes
 */

pub mod channel;
pub mod handler;
pub mod manager;
pub mod types;

// Re-export for convenience
pub use channel::{DrainResult, InboxEntry, Mailbox};
pub use handler::{handler, CommandHandler, HandlerFuture};
pub use manager::{IpcManager, KeepAlive};
pub use types::{ChannelId, IpcError, IpcMessage, IpcResult, IpcStats, MessageType, SendOutcome};

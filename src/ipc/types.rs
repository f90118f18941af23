/*!
 * IPC Types
 * Message envelope, send outcomes and statistics
 */

use crate::core::limits::DEFAULT_MESSAGE_TIMEOUT;
use crate::core::types::{now_micros, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::Duration;
use uuid::Uuid;

pub use crate::core::errors::{IpcError, IpcResult};

/// Channel identifier; equal to the owning process id
pub type ChannelId = String;

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Command,
    Response,
    Event,
    Heartbeat,
    Shutdown,
    Error,
}

impl MessageType {
    /// Whether the sender waits for a correlated reply
    #[inline]
    pub fn expects_reply(self) -> bool {
        matches!(self, MessageType::Command | MessageType::Shutdown)
    }

    /// Whether the message resolves a pending request
    #[inline]
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

/// IPC message envelope
///
/// `id`, `sender`, `recipient` and `timestamp` are stamped by the manager at
/// send time. After that the message is never modified.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcMessage {
    pub id: Uuid,
    pub message_type: MessageType,
    pub sender: ChannelId,
    pub recipient: ChannelId,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: u8,
    pub timestamp: Timestamp,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

impl IpcMessage {
    pub fn new(message_type: MessageType, command: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::nil(),
            message_type,
            sender: ChannelId::new(),
            recipient: ChannelId::new(),
            command: command.into(),
            payload,
            priority: 0,
            timestamp: 0,
            timeout: DEFAULT_MESSAGE_TIMEOUT,
            reply_to: None,
        }
    }

    /// A request answered by the recipient's handler for `command`
    pub fn command(command: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Command, command, payload)
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Event, name, payload)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, "heartbeat", Value::Null)
    }

    /// Shutdown request; answered by the recipient's `shutdown` handler
    pub fn shutdown(graceful: bool) -> Self {
        Self::new(
            MessageType::Shutdown,
            "shutdown",
            serde_json::json!({ "graceful": graceful }),
        )
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Successful reply addressed back to this message's sender
    pub fn response(&self, payload: Value) -> Self {
        let mut reply = Self::new(MessageType::Response, self.command.clone(), payload);
        reply.recipient = self.sender.clone();
        reply.reply_to = Some(self.id);
        reply.priority = self.priority;
        reply
    }

    /// Error reply carrying the original command name and error text
    pub fn error_reply(&self, error: impl Into<String>) -> Self {
        let mut reply = Self::new(
            MessageType::Error,
            self.command.clone(),
            serde_json::json!({ "command": self.command, "error": error.into() }),
        );
        reply.recipient = self.sender.clone();
        reply.reply_to = Some(self.id);
        reply.priority = self.priority;
        reply
    }

    /// Error text of an ERROR-typed message
    pub fn error_text(&self) -> Option<String> {
        if self.message_type != MessageType::Error {
            return None;
        }
        Some(
            self.payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.payload.to_string()),
        )
    }

    pub(crate) fn stamp(&mut self, sender: &str, recipient: &str) {
        if self.id.is_nil() {
            self.id = Uuid::new_v4();
        }
        self.sender = sender.to_string();
        self.recipient = recipient.to_string();
        self.timestamp = now_micros();
    }
}

/// Result of `IpcManager::send`
///
/// A timeout is a distinct outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Correlated RESPONSE received
    Response(IpcMessage),
    /// Recipient answered with an ERROR message
    Remote { command: String, error: String },
    /// No correlated reply within the message timeout
    Timeout,
    /// One-way message written to the recipient's inbox
    Delivered(Uuid),
}

impl SendOutcome {
    pub fn is_response(&self) -> bool {
        matches!(self, SendOutcome::Response(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SendOutcome::Timeout)
    }

    /// Payload of a successful response
    pub fn payload(&self) -> Option<&Value> {
        match self {
            SendOutcome::Response(msg) => Some(&msg.payload),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<Value> {
        match self {
            SendOutcome::Response(msg) => Some(msg.payload),
            _ => None,
        }
    }
}

/// IPC statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpcStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_quarantined: u64,
    pub responses_correlated: u64,
    pub unknown_replies: u64,
    pub timeouts: u64,
    pub handler_errors: u64,
    pub heartbeats_sent: u64,
    pub channels: usize,
    pub pending_requests: usize,
}

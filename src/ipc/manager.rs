/*!
 * IPC Manager
 * Channel table, request/response correlation and command dispatch
 *
 * Each manager owns one local channel (`owner`) and only ever scans that
 * channel's inbox. Peers are other mailboxes under the same root; a peer
 * that exists on disk but was never created locally is discovered on first
 * send, so a worker can answer the supervisor without registering it.
 *
 * Background loops (delivery, heartbeat, idle cleanup) hold a weak
 * reference to the manager and are cancelled and awaited on `shutdown`.
 */

use super::channel::{InboxEntry, Mailbox};
use super::handler::CommandHandler;
use super::types::{ChannelId, IpcError, IpcMessage, IpcResult, IpcStats, MessageType, SendOutcome};
use crate::core::config::IpcConfig;
use crate::core::limits::SUPERVISOR_CHANNEL;
use crate::core::task::{self, LoopTask};
use crate::core::types::{now_micros, Timestamp};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ChannelRecord {
    mailbox: Mailbox,
    created_at: Timestamp,
    last_activity: Timestamp,
}

struct PendingRequest {
    recipient: ChannelId,
    reply_tx: oneshot::Sender<IpcMessage>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    quarantined: AtomicU64,
    correlated: AtomicU64,
    unknown_replies: AtomicU64,
    timeouts: AtomicU64,
    handler_errors: AtomicU64,
    heartbeats: AtomicU64,
}

/// Predicate naming channels that idle cleanup must leave in place
pub type KeepAlive = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct IpcInner {
    config: IpcConfig,
    owner: ChannelId,
    local: Mailbox,
    channels: DashMap<ChannelId, ChannelRecord, RandomState>,
    handlers: DashMap<String, CommandHandler, RandomState>,
    pending: DashMap<Uuid, PendingRequest, RandomState>,
    sequence: AtomicU64,
    // Serializes inbox scans so each file is dispatched once
    inbox_lock: tokio::sync::Mutex<()>,
    counters: Counters,
    tasks: Mutex<Vec<LoopTask>>,
    keep_alive: RwLock<Option<KeepAlive>>,
    closed: AtomicBool,
}

/// IPC manager handle; cheap to clone
#[derive(Clone)]
pub struct IpcManager {
    inner: Arc<IpcInner>,
}

impl IpcManager {
    /// Create a manager and its local channel
    pub async fn new(config: IpcConfig, owner: impl Into<ChannelId>) -> IpcResult<Self> {
        let owner = owner.into();
        let local = Mailbox::new(&config.root, &owner);
        local.create().await?;

        let channels = DashMap::with_hasher(RandomState::new());
        let now = now_micros();
        channels.insert(
            owner.clone(),
            ChannelRecord {
                mailbox: local.clone(),
                created_at: now,
                last_activity: now,
            },
        );

        info!(owner = %owner, root = %config.root.display(), "IPC manager initialized");

        Ok(Self {
            inner: Arc::new(IpcInner {
                config,
                owner,
                local,
                channels,
                handlers: DashMap::with_hasher(RandomState::new()),
                pending: DashMap::with_hasher(RandomState::new()),
                sequence: AtomicU64::new(0),
                inbox_lock: tokio::sync::Mutex::new(()),
                counters: Counters::default(),
                tasks: Mutex::new(Vec::new()),
                keep_alive: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Supervisor-side manager owning the `supervisor` channel
    pub async fn supervisor(config: IpcConfig) -> IpcResult<Self> {
        Self::new(config, SUPERVISOR_CHANNEL).await
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn config(&self) -> &IpcConfig {
        &self.inner.config
    }

    /// Spawn the delivery, heartbeat and idle-cleanup loops
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        tasks.push(LoopTask::spawn(
            "ipc-delivery",
            self.inner.config.delivery_interval,
            with_manager(weak.clone(), |ipc| async move {
                ipc.process_inbox().await?;
                Ok(())
            }),
        ));
        tasks.push(LoopTask::spawn(
            "ipc-heartbeat",
            self.inner.config.heartbeat_interval,
            with_manager(weak.clone(), |ipc| async move {
                ipc.heartbeat().await?;
                Ok(())
            }),
        ));
        tasks.push(LoopTask::spawn(
            "ipc-cleanup",
            self.inner.config.cleanup_interval,
            with_manager(weak, |ipc| async move {
                ipc.cleanup_idle().await;
                Ok(())
            }),
        ));

        debug!(owner = %self.inner.owner, "IPC loops started");
    }

    /// Create (or adopt) the mailbox of `channel_id`
    pub async fn create_channel(&self, channel_id: &str) -> IpcResult<()> {
        self.ensure_open()?;
        let mailbox = Mailbox::new(&self.inner.config.root, channel_id);
        mailbox.create().await?;

        let now = now_micros();
        self.inner
            .channels
            .entry(channel_id.to_string())
            .and_modify(|record| record.last_activity = now)
            .or_insert_with(|| ChannelRecord {
                mailbox,
                created_at: now,
                last_activity: now,
            });

        info!(channel = %channel_id, "Channel created");
        Ok(())
    }

    /// Remove a channel and delete its mailbox
    ///
    /// Requests still waiting on the channel resolve with `ChannelNotFound`.
    /// The local channel is only dropped from the table, never deleted.
    pub async fn remove_channel(&self, channel_id: &str) -> IpcResult<bool> {
        let Some((_, record)) = self.inner.channels.remove(channel_id) else {
            return Ok(false);
        };

        self.inner
            .pending
            .retain(|_, pending| pending.recipient != channel_id);

        if channel_id != self.inner.owner {
            record.mailbox.destroy().await?;
        }

        info!(channel = %channel_id, "Channel removed");
        Ok(true)
    }

    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.inner.channels.contains_key(channel_id)
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.inner.channels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn last_activity(&self, channel_id: &str) -> Option<Timestamp> {
        self.inner.channels.get(channel_id).map(|r| r.last_activity)
    }

    pub fn channel_created_at(&self, channel_id: &str) -> Option<Timestamp> {
        self.inner.channels.get(channel_id).map(|r| r.created_at)
    }

    /// Send a message and, for COMMAND/SHUTDOWN, wait for the correlated reply
    ///
    /// A missing reply is `SendOutcome::Timeout`; an ERROR reply is
    /// `SendOutcome::Remote`. `Err` is reserved for local transport failures.
    pub async fn send(&self, recipient: &str, mut message: IpcMessage) -> IpcResult<SendOutcome> {
        self.ensure_open()?;
        message.stamp(&self.inner.owner, recipient);

        if !message.message_type.expects_reply() {
            let id = message.id;
            self.deliver(recipient, &message).await?;
            return Ok(SendOutcome::Delivered(id));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let id = message.id;
        let timeout = message.timeout;
        self.inner.pending.insert(
            id,
            PendingRequest {
                recipient: recipient.to_string(),
                reply_tx,
            },
        );

        if let Err(e) = self.deliver(recipient, &message).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                if reply.message_type == MessageType::Error {
                    let error = reply.error_text().unwrap_or_default();
                    Ok(SendOutcome::Remote {
                        command: reply.command,
                        error,
                    })
                } else {
                    Ok(SendOutcome::Response(reply))
                }
            }
            Ok(Err(_)) => {
                if self.inner.closed.load(Ordering::Acquire) {
                    Err(IpcError::Closed)
                } else {
                    Err(IpcError::ChannelNotFound(recipient.to_string()))
                }
            }
            Err(_) => {
                self.inner.pending.remove(&id);
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    recipient = %recipient,
                    command = %message.command,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Ok(SendOutcome::Timeout)
            }
        }
    }

    /// Send a COMMAND with the configured default timeout
    pub async fn request(&self, recipient: &str, command: &str, payload: Value) -> IpcResult<SendOutcome> {
        let message = IpcMessage::command(command, payload).with_timeout(self.inner.config.default_timeout);
        self.send(recipient, message).await
    }

    /// Send a COMMAND with an explicit timeout
    pub async fn request_with_timeout(
        &self,
        recipient: &str,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> IpcResult<SendOutcome> {
        self.send(recipient, IpcMessage::command(command, payload).with_timeout(timeout))
            .await
    }

    /// Write a message without registering for a reply
    pub async fn post(&self, recipient: &str, mut message: IpcMessage) -> IpcResult<Uuid> {
        self.ensure_open()?;
        message.stamp(&self.inner.owner, recipient);
        self.deliver(recipient, &message).await?;
        Ok(message.id)
    }

    /// Post a copy of `message` to every channel except the local one and `exclude`
    ///
    /// Returns the number of channels reached; failed deliveries are logged.
    pub async fn broadcast(&self, message: IpcMessage, exclude: &[&str]) -> IpcResult<usize> {
        self.ensure_open()?;
        let targets: Vec<ChannelId> = self
            .inner
            .channels
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| *id != self.inner.owner && !exclude.contains(&id.as_str()))
            .collect();

        let mut reached = 0;
        for target in targets {
            let mut copy = message.clone();
            copy.id = Uuid::nil();
            match self.post(&target, copy).await {
                Ok(_) => reached += 1,
                Err(e) => warn!(channel = %target, error = %e, "Broadcast delivery failed"),
            }
        }
        Ok(reached)
    }

    /// Bind `handler` to `command` on the local channel
    pub fn register_handler(&self, channel_id: &str, command: &str, handler: CommandHandler) -> IpcResult<()> {
        if channel_id != self.inner.owner {
            return Err(IpcError::NotLocal(channel_id.to_string()));
        }
        self.inner.handlers.insert(command.to_string(), handler);
        debug!(channel = %channel_id, command = %command, "Handler registered");
        Ok(())
    }

    pub fn unregister_handler(&self, command: &str) -> bool {
        self.inner.handlers.remove(command).is_some()
    }

    /// Scan the local inbox and dispatch every message once
    pub async fn process_inbox(&self) -> IpcResult<usize> {
        let _guard = self.inner.inbox_lock.lock().await;
        let drained = self.inner.local.drain().await?;

        if drained.quarantined > 0 {
            self.inner
                .counters
                .quarantined
                .fetch_add(drained.quarantined as u64, Ordering::Relaxed);
        }

        let count = drained.entries.len();
        for entry in drained.entries {
            self.inner.local.ack(&entry).await?;
            let InboxEntry { message, .. } = entry;
            self.dispatch(message).await;
        }
        Ok(count)
    }

    /// Broadcast one heartbeat to every peer channel
    pub async fn heartbeat(&self) -> IpcResult<usize> {
        let reached = self.broadcast(IpcMessage::heartbeat(), &[]).await?;
        self.inner
            .counters
            .heartbeats
            .fetch_add(reached as u64, Ordering::Relaxed);
        Ok(reached)
    }

    /// Remove channels idle for longer than the configured timeout
    pub async fn cleanup_idle(&self) -> Vec<ChannelId> {
        let now = now_micros();
        let idle_us = self.inner.config.idle_timeout.as_micros() as u64;

        let mut idle: Vec<ChannelId> = self
            .inner
            .channels
            .iter()
            .filter(|e| {
                let id = e.key();
                *id != self.inner.owner
                    && id != SUPERVISOR_CHANNEL
                    && now.saturating_sub(e.value().last_activity) > idle_us
            })
            .map(|e| e.key().clone())
            .collect();

        let keep_alive = self.inner.keep_alive.read().clone();
        if let Some(keep_alive) = keep_alive {
            idle.retain(|id| {
                let keep = keep_alive(id);
                if keep {
                    debug!(channel = %id, "Idle channel kept alive");
                }
                !keep
            });
        }

        for id in &idle {
            info!(channel = %id, "Removing idle channel");
            if let Err(e) = self.remove_channel(id).await {
                warn!(channel = %id, error = %e, "Failed to remove idle channel");
            }
        }
        idle
    }

    /// Exempt channels from idle cleanup while `keep_alive` holds for them
    pub fn set_keep_alive(&self, keep_alive: KeepAlive) {
        *self.inner.keep_alive.write() = Some(keep_alive);
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn stats(&self) -> IpcStats {
        let c = &self.inner.counters;
        IpcStats {
            messages_sent: c.sent.load(Ordering::Relaxed),
            messages_received: c.received.load(Ordering::Relaxed),
            messages_quarantined: c.quarantined.load(Ordering::Relaxed),
            responses_correlated: c.correlated.load(Ordering::Relaxed),
            unknown_replies: c.unknown_replies.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            heartbeats_sent: c.heartbeats.load(Ordering::Relaxed),
            channels: self.inner.channels.len(),
            pending_requests: self.inner.pending.len(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the background loops and abandon outstanding requests
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        task::shutdown_all(tasks).await;
        self.inner.pending.clear();

        info!(owner = %self.inner.owner, "IPC manager shut down");
    }

    fn ensure_open(&self) -> IpcResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(IpcError::Closed)
        } else {
            Ok(())
        }
    }

    async fn resolve(&self, channel_id: &str) -> IpcResult<Mailbox> {
        if let Some(record) = self.inner.channels.get(channel_id) {
            return Ok(record.mailbox.clone());
        }

        let mailbox = Mailbox::new(&self.inner.config.root, channel_id);
        if !mailbox.exists().await {
            return Err(IpcError::ChannelNotFound(channel_id.to_string()));
        }

        let now = now_micros();
        self.inner
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelRecord {
                mailbox: mailbox.clone(),
                created_at: now,
                last_activity: now,
            });
        debug!(channel = %channel_id, "Peer channel discovered");
        Ok(mailbox)
    }

    async fn deliver(&self, recipient: &str, message: &IpcMessage) -> IpcResult<()> {
        let target = self.resolve(recipient).await?;
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        self.inner.local.deliver(&target, message, seq).await?;
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn touch(&self, channel_id: &str) {
        if let Some(mut record) = self.inner.channels.get_mut(channel_id) {
            record.last_activity = now_micros();
        }
    }

    async fn dispatch(&self, message: IpcMessage) {
        self.inner.counters.received.fetch_add(1, Ordering::Relaxed);
        self.touch(&message.sender);

        match message.message_type {
            MessageType::Response | MessageType::Error => self.resolve_reply(message),
            MessageType::Heartbeat => {
                // Echoes carry `reply_to` and are never echoed again
                if message.reply_to.is_none() {
                    let mut echo = IpcMessage::heartbeat();
                    echo.reply_to = Some(message.id);
                    if let Err(e) = self.post(&message.sender, echo).await {
                        debug!(channel = %message.sender, error = %e, "Heartbeat echo failed");
                    }
                }
            }
            MessageType::Command | MessageType::Shutdown => self.run_handler(message).await,
            MessageType::Event => {
                if let Some(handler) = self.lookup(&message.command) {
                    let command = message.command.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler(message).await {
                            warn!(event = %command, error = %e, "Event handler failed");
                        }
                    });
                } else {
                    debug!(event = %message.command, sender = %message.sender, "Unhandled event");
                }
            }
        }
    }

    fn resolve_reply(&self, reply: IpcMessage) {
        let Some(request_id) = reply.reply_to else {
            self.inner.counters.unknown_replies.fetch_add(1, Ordering::Relaxed);
            debug!(sender = %reply.sender, "Reply without correlation id dropped");
            return;
        };

        match self.inner.pending.remove(&request_id) {
            Some((_, pending)) => {
                self.inner.counters.correlated.fetch_add(1, Ordering::Relaxed);
                // Receiver may have timed out in the meantime
                let _ = pending.reply_tx.send(reply);
            }
            None => {
                self.inner.counters.unknown_replies.fetch_add(1, Ordering::Relaxed);
                debug!(reply_to = %request_id, sender = %reply.sender, "Reply for unknown request ignored");
            }
        }
    }

    fn lookup(&self, command: &str) -> Option<CommandHandler> {
        self.inner.handlers.get(command).map(|h| h.value().clone())
    }

    async fn run_handler(&self, message: IpcMessage) {
        let Some(handler) = self.lookup(&message.command) else {
            self.inner.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
            warn!(command = %message.command, sender = %message.sender, "No handler for command");
            let reply = message.error_reply(format!("Unknown command: {}", message.command));
            if let Err(e) = self.post(&message.sender, reply).await {
                debug!(channel = %message.sender, error = %e, "Error reply failed");
            }
            return;
        };

        // Handlers may themselves send requests, so they never run on the delivery loop
        let ipc = self.clone();
        tokio::spawn(async move {
            let sender = message.sender.clone();
            let reply = match handler(message.clone()).await {
                Ok(payload) => message.response(payload),
                Err(e) => {
                    ipc.inner.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(command = %message.command, error = %e, "Command handler failed");
                    message.error_reply(e.to_string())
                }
            };
            if let Err(e) = ipc.post(&sender, reply).await {
                debug!(channel = %sender, error = %e, "Reply delivery failed");
            }
        });
    }
}

/// Adapt a manager operation into a loop tick bound to a weak reference
fn with_manager<F, Fut>(
    weak: Weak<IpcInner>,
    op: F,
) -> impl FnMut() -> futures::future::BoxFuture<'static, anyhow::Result<()>> + Send + 'static
where
    F: Fn(IpcManager) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let op = Arc::new(op);
    move || {
        let weak = weak.clone();
        let op = op.clone();
        Box::pin(async move {
            match weak.upgrade() {
                Some(inner) => op(IpcManager { inner }).await,
                None => Ok(()),
            }
        })
    }
}

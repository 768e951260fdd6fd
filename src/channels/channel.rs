//! Channel contract and the shared behavior every channel composes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::bus::{Attachment, InboundMessage, MessageBus, OutboundMessage, Shutdown};
use crate::error::{BusError, ChannelError};

/// A communication surface with its own connection lifecycle.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique name; outbound messages are routed by it.
    fn name(&self) -> &str;

    /// Begin producing inbound messages. Errors if already running.
    async fn start(&self, shutdown: Shutdown) -> Result<(), ChannelError>;

    /// Stop producing messages and release connections.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Deliver an outbound message (or act on a reserved command).
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Allow-list, running flag and bus hand-off shared by all channels.
pub struct ChannelBase {
    name: String,
    allow_list: HashSet<String>,
    running: AtomicBool,
    bus: Arc<MessageBus>,
}

impl ChannelBase {
    pub fn new(name: impl Into<String>, allow_list: Vec<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            name: name.into(),
            allow_list: allow_list.into_iter().collect(),
            running: AtomicBool::new(false),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Empty allow-list admits everyone; otherwise an exact, case-sensitive match.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(sender_id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flip the running flag; returns the previous value.
    pub fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::AcqRel)
    }

    /// Mark the channel running, or fail if it already was.
    pub fn begin_start(&self) -> Result<(), ChannelError> {
        if self.set_running(true) {
            return Err(ChannelError::AlreadyRunning {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// The single path from a channel into the bus.
    ///
    /// Returns `Ok(false)` when the sender is not allowed; nothing is
    /// published in that case.
    pub async fn handle_message(
        &self,
        sender_id: &str,
        chat_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        metadata: BTreeMap<String, String>,
    ) -> Result<bool, BusError> {
        if !self.is_allowed(sender_id) {
            debug!(channel = %self.name, sender = %sender_id, "Sender not allowed, ignoring");
            return Ok(false);
        }

        let msg = InboundMessage::new(&self.name, sender_id, chat_id, content)
            .with_attachments(attachments)
            .with_metadata(metadata);
        self.bus.publish_inbound(msg).await?;
        Ok(true)
    }
}

/// Single-slot "check now" signal.
///
/// Requests never block; while one is pending, further requests coalesce.
pub struct ManualTrigger {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl ManualTrigger {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Request a check. Returns `false` if one was already pending.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    /// Wait for the next request.
    pub async fn wait(&self) {
        // The sender lives in `self`, so recv() never yields None here.
        let _ = self.rx.lock().await.recv().await;
    }

    /// Consume a pending request without waiting.
    pub async fn take_pending(&self) -> bool {
        self.rx.lock().await.try_recv().is_ok()
    }
}

impl Default for ManualTrigger {
    fn default() -> Self {
        Self::new()
    }
}

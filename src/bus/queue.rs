//! Process-wide message bus.
//!
//! Inbound messages flow from channels into a bounded queue that the agent
//! loop drains. Outbound messages are queued without blocking and routed by
//! a dispatcher task to a per-channel worker for the channel whose name
//! matches the target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::message::{InboundMessage, OutboundMessage};
use crate::channels::Channel;
use crate::config::BusConfig;
use crate::error::{BusError, ChannelError};

/// Receiver half of the process-wide shutdown signal. `true` means stop.
pub type Shutdown = watch::Receiver<bool>;

/// Create the process-wide shutdown signal.
pub fn shutdown_signal() -> (watch::Sender<bool>, Shutdown) {
    watch::channel(false)
}

/// Router between channels and the agent loop.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    /// Taken once by the dispatcher.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    publish_timeout: Duration,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            channels: RwLock::new(HashMap::new()),
            publish_timeout: config.publish_timeout,
        })
    }

    /// Register a channel under its own name. Called during startup only.
    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        if self
            .channels
            .write()
            .await
            .insert(name.clone(), channel)
            .is_some()
        {
            warn!(channel = %name, "Channel registered twice; keeping the latest");
        } else {
            debug!(channel = %name, "Registered channel");
        }
    }

    /// Look up a registered channel.
    pub async fn channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// All registered channels, in no particular order.
    pub async fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().await.values().cloned().collect()
    }

    /// Hand a message to the agent loop.
    ///
    /// Waits up to the configured publish timeout when the queue is full,
    /// then gives up with [`BusError::InboundFull`]. Nothing is dropped
    /// silently: the caller learns about every failure.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError> {
        let id = msg.id;
        match self.inbound_tx.send_timeout(msg, self.publish_timeout).await {
            Ok(()) => {
                debug!(id = %id, "Inbound message queued");
                Ok(())
            }
            Err(SendTimeoutError::Timeout(msg)) => {
                warn!(
                    id = %id,
                    channel = %msg.source_channel,
                    timeout = ?self.publish_timeout,
                    "Inbound queue full, publish timed out"
                );
                Err(BusError::InboundFull {
                    timeout: self.publish_timeout,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(BusError::InboundClosed),
        }
    }

    /// Receive the next inbound message. Concurrent consumers compete, each
    /// message is delivered to exactly one of them.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Receive an inbound message if one is already queued.
    pub async fn try_consume_inbound(&self) -> Option<InboundMessage> {
        match self.inbound_rx.lock().await.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Number of inbound messages waiting for the agent loop.
    pub fn pending_inbound(&self) -> usize {
        self.inbound_tx.max_capacity() - self.inbound_tx.capacity()
    }

    /// Queue a message for delivery to its target channel. Never blocks.
    pub fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        self.outbound_tx.send(msg).map_err(|e| {
            warn!(channel = %e.0.target_channel, "Outbound dispatcher gone, dropping message");
            BusError::OutboundClosed
        })
    }

    /// Deliver one outbound message to the channel named by its target.
    pub async fn route(&self, msg: OutboundMessage) -> Result<(), ChannelError> {
        let Some(channel) = self.channel(&msg.target_channel).await else {
            warn!(
                channel = %msg.target_channel,
                chat_id = %msg.chat_id,
                "No channel registered for outbound message, dropping"
            );
            return Err(BusError::UnknownChannel(msg.target_channel).into());
        };
        channel.send(&msg).await
    }

    /// Spawn the outbound dispatcher. Returns `None` if one is already running.
    ///
    /// Each target channel gets its own delivery worker, so messages to one
    /// channel stay in order while a slow `send` holds up only that channel.
    pub async fn dispatch_outbound(
        self: &Arc<Self>,
        mut shutdown: Shutdown,
    ) -> Option<JoinHandle<()>> {
        let Some(mut rx) = self.outbound_rx.lock().await.take() else {
            warn!("Outbound dispatcher already started");
            return None;
        };
        let bus = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!("Outbound dispatcher started");
            let mut workers: HashMap<String, OutboundWorker> = HashMap::new();
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        bus.hand_to_worker(&mut workers, msg).await;
                    }
                }
            }

            // Workers finish what they already hold, then exit.
            let handles: Vec<_> = workers.into_values().map(OutboundWorker::close).collect();
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Outbound worker panicked: {e}");
                }
            }
            info!("Outbound dispatcher stopped");
        }))
    }

    async fn hand_to_worker(
        &self,
        workers: &mut HashMap<String, OutboundWorker>,
        msg: OutboundMessage,
    ) {
        if !workers.contains_key(&msg.target_channel) {
            let Some(channel) = self.channel(&msg.target_channel).await else {
                warn!(
                    channel = %msg.target_channel,
                    chat_id = %msg.chat_id,
                    "No channel registered for outbound message, dropping"
                );
                return;
            };
            workers.insert(msg.target_channel.clone(), OutboundWorker::spawn(channel));
        }
        if let Some(worker) = workers.get(&msg.target_channel) {
            worker.push(msg);
        }
    }
}

/// Delivery queue and task for one target channel.
struct OutboundWorker {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    handle: JoinHandle<()>,
}

impl OutboundWorker {
    fn spawn(channel: Arc<dyn Channel>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let handle = tokio::spawn(async move {
            debug!(channel = %channel.name(), "Outbound worker started");
            while let Some(msg) = rx.recv().await {
                if let Err(e) = channel.send(&msg).await {
                    error!(
                        channel = %channel.name(),
                        chat_id = %msg.chat_id,
                        "Outbound delivery failed: {e}"
                    );
                }
            }
        });
        Self { tx, handle }
    }

    fn push(&self, msg: OutboundMessage) {
        if let Err(e) = self.tx.send(msg) {
            error!(channel = %e.0.target_channel, "Outbound worker gone, dropping message");
        }
    }

    fn close(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;

    struct RecordingChannel {
        name: String,
        delay: Duration,
        sent: StdMutex<Vec<OutboundMessage>>,
    }

    impl RecordingChannel {
        fn new(name: &str) -> Arc<Self> {
            Self::slow(name, Duration::ZERO)
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay,
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn contents(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|m| m.content.clone()).collect()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            &self.name
        }
        async fn start(&self, _shutdown: Shutdown) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn bus(capacity: usize, timeout_ms: u64) -> Arc<MessageBus> {
        MessageBus::new(BusConfig {
            inbound_capacity: capacity,
            publish_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test]
    async fn inbound_is_fifo_per_publisher() {
        let bus = bus(10, 100);
        for i in 0..3 {
            bus.publish_inbound(InboundMessage::new("cli", "u", "u", format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(bus.pending_inbound(), 3);
        for i in 0..3 {
            let msg = bus.consume_inbound().await.unwrap();
            assert_eq!(msg.content, format!("m{i}"));
        }
        assert!(bus.try_consume_inbound().await.is_none());
    }

    #[tokio::test]
    async fn full_inbound_queue_times_out_instead_of_dropping() {
        let bus = bus(1, 20);
        bus.publish_inbound(InboundMessage::new("cli", "u", "u", "first"))
            .await
            .unwrap();
        let err = bus
            .publish_inbound(InboundMessage::new("cli", "u", "u", "second"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InboundFull { .. }));
        assert_eq!(bus.consume_inbound().await.unwrap().content, "first");
    }

    #[tokio::test]
    async fn full_inbound_queue_unblocks_when_drained() {
        let bus = bus(1, 1_000);
        bus.publish_inbound(InboundMessage::new("cli", "u", "u", "first"))
            .await
            .unwrap();

        let consumer = Arc::clone(&bus);
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            consumer.consume_inbound().await
        });

        bus.publish_inbound(InboundMessage::new("cli", "u", "u", "second"))
            .await
            .unwrap();
        assert_eq!(drain.await.unwrap().unwrap().content, "first");
        assert_eq!(bus.consume_inbound().await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn route_delivers_to_named_channel() {
        let bus = bus(10, 100);
        let email = RecordingChannel::new("email");
        let discord = RecordingChannel::new("discord");
        bus.register(email.clone()).await;
        bus.register(discord.clone()).await;

        bus.route(OutboundMessage::new("discord", "12345", "hi"))
            .await
            .unwrap();

        assert!(email.sent.lock().unwrap().is_empty());
        let sent = discord.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "12345");
    }

    #[tokio::test]
    async fn route_to_unknown_channel_is_reported_not_fatal() {
        let bus = bus(10, 100);
        let err = bus
            .route(OutboundMessage::new("slack", "c", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Bus(BusError::UnknownChannel(ref n)) if n == "slack"));
    }

    #[tokio::test]
    async fn dispatcher_routes_and_survives_unknown_targets() {
        let bus = bus(10, 100);
        let discord = RecordingChannel::new("discord");
        bus.register(discord.clone()).await;

        let (stop_tx, stop_rx) = shutdown_signal();
        let handle = bus.dispatch_outbound(stop_rx).await.unwrap();
        assert!(bus.dispatch_outbound(shutdown_signal().1).await.is_none());

        bus.publish_outbound(OutboundMessage::new("nowhere", "c", "lost"))
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("discord", "c", "kept"))
            .unwrap();

        for _ in 0..50 {
            if !discord.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(discord.sent.lock().unwrap()[0].content, "kept");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(matches!(
            bus.publish_outbound(OutboundMessage::new("discord", "c", "late")),
            Err(BusError::OutboundClosed)
        ));
    }

    #[tokio::test]
    async fn slow_channel_does_not_delay_other_channels() {
        let bus = bus(10, 100);
        let email = RecordingChannel::slow("email", Duration::from_secs(2));
        let discord = RecordingChannel::new("discord");
        bus.register(email.clone()).await;
        bus.register(discord.clone()).await;

        let (stop_tx, stop_rx) = shutdown_signal();
        let handle = bus.dispatch_outbound(stop_rx).await.unwrap();

        let started = tokio::time::Instant::now();
        bus.publish_outbound(OutboundMessage::new("email", "bob@example.com", "slow"))
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("discord", "12345", "fast"))
            .unwrap();

        wait_for(|| !discord.sent.lock().unwrap().is_empty()).await;
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "discord waited {:?} behind email",
            started.elapsed()
        );
        assert!(email.sent.lock().unwrap().is_empty());

        // Stopping lets the in-flight send complete.
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(email.contents(), vec!["slow"]);
    }

    #[tokio::test]
    async fn messages_to_one_channel_keep_their_order() {
        let bus = bus(10, 100);
        let email = RecordingChannel::slow("email", Duration::from_millis(5));
        bus.register(email.clone()).await;

        let (stop_tx, stop_rx) = shutdown_signal();
        let handle = bus.dispatch_outbound(stop_rx).await.unwrap();
        for i in 0..5 {
            bus.publish_outbound(OutboundMessage::new("email", "c", format!("m{i}")))
                .unwrap();
        }

        wait_for(|| email.sent.lock().unwrap().len() == 5).await;
        assert_eq!(email.contents(), vec!["m0", "m1", "m2", "m3", "m4"]);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

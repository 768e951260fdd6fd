//! CLI channel: stdin/stdout REPL for local testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{MessageBus, OutboundMessage, Shutdown};
use crate::channels::channel::{Channel, ChannelBase};
use crate::channels::email::CHANNEL_NAME as EMAIL_CHANNEL;
use crate::error::{BusError, ChannelError};

/// Sender and chat id used for everything typed at the terminal.
pub const LOCAL_USER: &str = "local-user";

/// What a single input line asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum CliInput<'a> {
    Empty,
    /// `/check`: poll the email channel now.
    Check,
    Message(&'a str),
}

pub fn parse_line(line: &str) -> CliInput<'_> {
    match line.trim() {
        "" => CliInput::Empty,
        "/check" => CliInput::Check,
        text => CliInput::Message(text),
    }
}

/// Reads stdin lines as inbound messages and prints outbound ones.
pub struct CliChannel {
    base: Arc<ChannelBase>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CliChannel {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            base: Arc::new(ChannelBase::new("cli", Vec::new(), bus)),
            reader: Mutex::new(None),
        }
    }
}

/// Act on one line. Returns `false` once the bus can no longer take input.
async fn handle_line(base: &ChannelBase, line: &str) -> bool {
    match parse_line(line) {
        CliInput::Empty => true,
        CliInput::Check => {
            if let Err(e) = base.bus().publish_outbound(OutboundMessage::check(EMAIL_CHANNEL)) {
                tracing::warn!("Could not request email check: {e}");
            }
            true
        }
        CliInput::Message(text) => {
            match base
                .handle_message(LOCAL_USER, LOCAL_USER, text, Vec::new(), BTreeMap::new())
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!("Dropping CLI input: {e}");
                    !matches!(e, BusError::InboundClosed)
                }
            }
        }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, mut shutdown: Shutdown) -> Result<(), ChannelError> {
        self.base.begin_start()?;
        let base = Arc::clone(&self.base);

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            eprint!("> ");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !handle_line(&base, &line).await {
                                break;
                            }
                            eprint!("> ");
                        }
                        Ok(None) => break, // EOF
                        Err(e) => {
                            tracing::error!("Error reading stdin: {}", e);
                            break;
                        }
                    }
                }
            }
        });
        *self.reader.lock().await = Some(handle);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        println!("\n{}\n", msg.content);
        eprint!("> ");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        // stdin reads cannot be cancelled cooperatively.
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.base.set_running(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::shutdown_signal;
    use crate::config::BusConfig;

    #[test]
    fn parse_line_variants() {
        assert_eq!(parse_line("   "), CliInput::Empty);
        assert_eq!(parse_line("/check"), CliInput::Check);
        assert_eq!(parse_line("  /check  "), CliInput::Check);
        assert_eq!(parse_line(" hello "), CliInput::Message("hello"));
        assert_eq!(parse_line("/check now"), CliInput::Message("/check now"));
    }

    #[tokio::test]
    async fn text_lines_become_inbound_messages() {
        let bus = MessageBus::new(BusConfig::default());
        let base = ChannelBase::new("cli", Vec::new(), Arc::clone(&bus));

        assert!(handle_line(&base, "").await);
        assert!(handle_line(&base, "what's new?").await);

        let msg = bus.try_consume_inbound().await.unwrap();
        assert_eq!(msg.source_channel, "cli");
        assert_eq!(msg.sender_id, LOCAL_USER);
        assert_eq!(msg.content, "what's new?");
        assert!(bus.try_consume_inbound().await.is_none());
    }

    #[tokio::test]
    async fn check_line_goes_out_to_the_email_channel() {
        use std::sync::Mutex as StdMutex;

        struct Sink(StdMutex<Vec<OutboundMessage>>);

        #[async_trait]
        impl Channel for Sink {
            fn name(&self) -> &str {
                EMAIL_CHANNEL
            }
            async fn start(&self, _shutdown: Shutdown) -> Result<(), ChannelError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), ChannelError> {
                Ok(())
            }
            async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
                self.0.lock().unwrap().push(msg.clone());
                Ok(())
            }
        }

        let bus = MessageBus::new(BusConfig::default());
        let sink = Arc::new(Sink(StdMutex::new(Vec::new())));
        bus.register(sink.clone()).await;
        let (shutdown_tx, shutdown) = shutdown_signal();
        let dispatcher = bus.dispatch_outbound(shutdown).await.unwrap();

        let base = ChannelBase::new("cli", Vec::new(), Arc::clone(&bus));
        assert!(handle_line(&base, "/check").await);

        for _ in 0..100 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let sent = sink.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_check_command());
        assert_eq!(bus.pending_inbound(), 0);

        shutdown_tx.send_replace(true);
        dispatcher.await.unwrap();
    }
}

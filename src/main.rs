use std::sync::Arc;

use anyhow::Context;
use mailbus::bus::{MessageBus, shutdown_signal};
use mailbus::channels::smtp::LettreSmtp;
use mailbus::channels::{Channel, CliChannel, EmailChannel};
use mailbus::config::{BusConfig, EmailConfig};
use mailbus::tools::{CheckEmailTool, SendEmailTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let bus_config = BusConfig::from_env();
    let email_config = EmailConfig::from_env().context("invalid email configuration")?;

    eprintln!("📬 Mailbus v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Inbound queue: {} (publish timeout {:?})",
        bus_config.inbound_capacity, bus_config.publish_timeout
    );
    match &email_config {
        Some(cfg) => {
            let accounts: Vec<&str> = cfg.accounts.iter().map(|a| a.email.as_str()).collect();
            eprintln!("   Email: {} every {:?}", accounts.join(", "), cfg.poll_interval);
            if let Some(target) = &cfg.forward_to {
                eprintln!("   Forwarding to {}:{}", target.channel, target.chat_id);
            }
        }
        None => eprintln!("   Email: disabled (set EMAIL_ACCOUNTS or EMAIL_IMAP_HOST)"),
    }
    eprintln!("   Type a message and press Enter. /check polls email now.\n");

    // ── Bus and channels ─────────────────────────────────────────────────
    let bus = MessageBus::new(bus_config);
    bus.register(Arc::new(CliChannel::new(Arc::clone(&bus)))).await;
    if let Some(cfg) = email_config.clone() {
        bus.register(Arc::new(EmailChannel::new(cfg, Arc::clone(&bus))))
            .await;
    }

    // ── Tools ────────────────────────────────────────────────────────────
    let tools = ToolRegistry::new();
    tools
        .register(Arc::new(CheckEmailTool::new(Arc::clone(&bus))))
        .await;
    tools
        .register(Arc::new(SendEmailTool::new(
            email_config,
            Arc::new(LettreSmtp::new()),
        )))
        .await;
    let tool_names = tools.list().await;
    tracing::info!(tools = ?tool_names, "Tools registered");

    let (shutdown_tx, shutdown) = shutdown_signal();
    let dispatcher = bus.dispatch_outbound(shutdown.clone()).await;

    let channels = bus.channels().await;
    for channel in &channels {
        if let Err(e) = channel.start(shutdown.clone()).await {
            tracing::error!(channel = %channel.name(), "Failed to start channel: {e}");
        }
    }

    // The agent loop is an external collaborator; here inbound is only logged.
    let consumer = {
        let bus = Arc::clone(&bus);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    msg = bus.consume_inbound() => {
                        let Some(msg) = msg else { break };
                        tracing::info!(
                            id = %msg.id,
                            channel = %msg.source_channel,
                            sender = %msg.sender_id,
                            chat_id = %msg.chat_id,
                            attachments = msg.attachments.len(),
                            "Inbound message: {}",
                            msg.content.lines().next().unwrap_or_default()
                        );
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    shutdown_tx.send_replace(true);

    for channel in &channels {
        if let Err(e) = channel.stop().await {
            tracing::warn!(channel = %channel.name(), "Failed to stop channel: {e}");
        }
    }
    if let Some(dispatcher) = dispatcher {
        let _ = dispatcher.await;
    }
    let _ = consumer.await;

    Ok(())
}

//! Email channel: IMAP polling for inbound mail, SMTP for outbound.
//!
//! Each configured account owns one mail-store session. A single poll task
//! walks every account per cycle; cycles run on start, on every tick, and
//! whenever a "check now" request arrives.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, OutboundMessage, Shutdown};
use crate::channels::channel::{Channel, ChannelBase, ManualTrigger};
use crate::channels::email_types::{
    ParsedMail, extract_subject, forward_summary, inbound_content,
};
use crate::channels::imap::{ImapStore, MailSession, MailStore};
use crate::channels::smtp::{LettreSmtp, OutgoingMail, SmtpConnector, deliver};
use crate::config::{EmailConfig, MailAccount};
use crate::error::{ChannelError, ErrorClass, MailError};

/// Name the channel registers under.
pub const CHANNEL_NAME: &str = "email";

/// Most unread messages handled per account per cycle.
pub const MAX_PER_CYCLE: usize = 10;

/// Connection state of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Selected,
}

struct AccountSlot {
    account: MailAccount,
    state: ConnectionState,
    session: Option<Box<dyn MailSession>>,
}

impl AccountSlot {
    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().await;
        }
        self.state = ConnectionState::Disconnected;
    }
}

/// What one poll cycle did, summed over all accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub accounts_checked: usize,
    pub published: usize,
    pub marked_seen: usize,
    pub stale: usize,
    pub rejected: usize,
    /// Unread messages beyond the per-cycle cap, left for a later cycle.
    pub deferred: usize,
    pub forwarded: usize,
    pub publish_failures: usize,
    pub account_failures: usize,
}

/// IMAP/SMTP email channel.
pub struct EmailChannel {
    inner: Arc<EmailInner>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

struct EmailInner {
    base: ChannelBase,
    config: EmailConfig,
    store: Arc<dyn MailStore>,
    smtp: Arc<dyn SmtpConnector>,
    /// Held for a whole cycle, so cycles never overlap.
    slots: Mutex<Vec<AccountSlot>>,
    trigger: ManualTrigger,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, bus: Arc<MessageBus>) -> Self {
        Self::with_transports(config, bus, Arc::new(ImapStore::new()), Arc::new(LettreSmtp::new()))
    }

    /// Build the channel over explicit mail-store and SMTP implementations.
    pub fn with_transports(
        config: EmailConfig,
        bus: Arc<MessageBus>,
        store: Arc<dyn MailStore>,
        smtp: Arc<dyn SmtpConnector>,
    ) -> Self {
        let slots = config
            .accounts
            .iter()
            .map(|account| AccountSlot {
                account: account.clone(),
                state: ConnectionState::Disconnected,
                session: None,
            })
            .collect();
        let (stop_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(EmailInner {
                base: ChannelBase::new(CHANNEL_NAME, config.allow_from.clone(), bus),
                config,
                store,
                smtp,
                slots: Mutex::new(slots),
                trigger: ManualTrigger::new(),
            }),
            task: Mutex::new(None),
            stop_tx,
        }
    }

    /// Ask the poll task to run a cycle now. Returns `false` if a request
    /// was already pending (the two coalesce).
    pub fn check_now(&self) -> bool {
        let queued = self.inner.trigger.request();
        debug!(queued, "Manual email check requested");
        queued
    }

    /// Run one poll cycle on the caller's task.
    pub async fn poll_once(&self) -> PollReport {
        self.inner.poll_cycle().await
    }

    /// Per-account connection state, in configuration order.
    pub async fn connection_states(&self) -> Vec<(String, ConnectionState)> {
        self.inner
            .slots
            .lock()
            .await
            .iter()
            .map(|s| (s.account.email.clone(), s.state))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.base.is_running()
    }
}

impl EmailInner {
    async fn poll_loop(self: Arc<Self>, mut shutdown: Shutdown, mut stop: watch::Receiver<bool>) {
        let period = self.config.poll_interval;
        info!(
            accounts = self.config.accounts.len(),
            interval = ?period,
            "Email poll loop started"
        );

        self.poll_cycle().await;

        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tick.tick() => {}
                _ = self.trigger.wait() => {
                    debug!("Manual email check");
                }
            }

            self.poll_cycle().await;

            if *shutdown.borrow() || *stop.borrow() {
                break;
            }
        }
        info!("Email poll loop stopped");
    }

    async fn poll_cycle(&self) -> PollReport {
        let mut report = PollReport::default();
        let mut slots = self.slots.lock().await;

        for slot in slots.iter_mut() {
            report.accounts_checked += 1;
            if let Err(e) = self.poll_account(slot, &mut report).await {
                report.account_failures += 1;
                match e.class() {
                    ErrorClass::Connection => {
                        warn!(account = %slot.account.email, "Mail store connection error: {e}");
                        slot.disconnect().await;
                    }
                    ErrorClass::Protocol => {
                        warn!(account = %slot.account.email, "Mail store protocol error: {e}");
                    }
                }
            }
        }

        if report.published > 0 || report.account_failures > 0 {
            info!(
                published = report.published,
                stale = report.stale,
                rejected = report.rejected,
                deferred = report.deferred,
                failures = report.account_failures,
                "Email poll cycle finished"
            );
        } else {
            debug!(?report, "Email poll cycle finished");
        }
        report
    }

    async fn poll_account(
        &self,
        slot: &mut AccountSlot,
        report: &mut PollReport,
    ) -> Result<(), MailError> {
        let AccountSlot {
            account,
            state,
            session,
        } = slot;

        if session.is_none() {
            *state = ConnectionState::Connecting;
            debug!(account = %account.email, host = %account.imap_host, "Connecting to mail store");
            let connected = self.store.connect(account).await.inspect_err(|_| {
                *state = ConnectionState::Disconnected;
            })?;
            *state = ConnectionState::Authenticated;
            info!(account = %account.email, "Mail store session established");
            *session = Some(connected);
        }
        let Some(session) = session.as_mut() else {
            return Err(MailError::Closed);
        };

        // Any select failure tears the session down.
        let exists = session.select_inbox().await.map_err(|e| match e {
            MailError::Select { .. } => e,
            other => MailError::Select {
                mailbox: "INBOX".into(),
                reason: other.to_string(),
            },
        })?;
        *state = ConnectionState::Selected;
        if exists == 0 {
            return Ok(());
        }

        let mut uids = session.search_unseen().await?;
        uids.sort_unstable();
        uids.dedup();
        if uids.len() > MAX_PER_CYCLE {
            let excess = uids.len() - MAX_PER_CYCLE;
            report.deferred += excess;
            uids.drain(..excess);
        }
        if uids.is_empty() {
            return Ok(());
        }

        let mut fetched = session.fetch(&uids).await?;
        fetched.sort_by_key(|m| m.uid);
        fetched.dedup_by_key(|m| m.uid);

        let now = Utc::now();
        for raw in fetched {
            let Some(mail) = ParsedMail::parse(raw.uid, &raw.bytes) else {
                warn!(account = %account.email, uid = raw.uid, "Unparseable message, leaving unread");
                continue;
            };

            if mail.is_stale(now) {
                debug!(account = %account.email, uid = mail.uid, "Skipping stale message");
                report.stale += 1;
                continue;
            }

            let sender = mail.sender.clone().unwrap_or_default();
            if !self.base.is_allowed(&sender) {
                debug!(account = %account.email, sender = %sender, "Sender not allowed, leaving unread");
                report.rejected += 1;
                continue;
            }

            if self.forward(account, &sender, &mail) {
                report.forwarded += 1;
            }

            let content = inbound_content(&account.email, &mail.subject, &mail.body);
            let metadata = BTreeMap::from([
                ("subject".to_string(), mail.subject.clone()),
                ("email".to_string(), sender.clone()),
                ("to".to_string(), account.email.clone()),
                ("uid".to_string(), mail.uid.to_string()),
            ]);

            // The sender already passed the allow-list above.
            if let Err(e) = self
                .base
                .handle_message(&sender, &sender, &content, mail.attachments, metadata)
                .await
            {
                // The rest of the batch would hit the same full queue.
                error!(account = %account.email, uid = mail.uid, "Inbound publish failed, leaving unread: {e}");
                report.publish_failures += 1;
                break;
            }
            report.published += 1;

            session.mark_seen(mail.uid).await?;
            report.marked_seen += 1;
        }

        Ok(())
    }

    /// Mirror a summary to the forward target, if one is configured.
    fn forward(&self, account: &MailAccount, sender: &str, mail: &ParsedMail) -> bool {
        let Some(target) = &self.config.forward_to else {
            return false;
        };
        let summary = forward_summary(&account.email, sender, &mail.subject, &mail.body);
        match self
            .base
            .bus()
            .publish_outbound(OutboundMessage::new(&target.channel, &target.chat_id, summary))
        {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %target.channel, "Failed to forward email summary: {e}");
                false
            }
        }
    }

    async fn logout_all(&self) {
        for slot in self.slots.lock().await.iter_mut() {
            if slot.session.is_some() {
                debug!(account = %slot.account.email, "Logging out");
            }
            slot.disconnect().await;
        }
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        self.inner.base.name()
    }

    async fn start(&self, shutdown: Shutdown) -> Result<(), ChannelError> {
        if self.inner.config.accounts.is_empty() {
            return Err(ChannelError::StartupFailed {
                name: CHANNEL_NAME.into(),
                reason: "no email accounts configured".into(),
            });
        }
        self.inner.base.begin_start()?;

        self.stop_tx.send_replace(false);
        let stop = self.stop_tx.subscribe();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.poll_loop(shutdown, stop));
        *self.task.lock().await = Some(handle);

        info!(accounts = self.inner.config.accounts.len(), "Email channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if !self.inner.base.is_running() {
            return Ok(());
        }

        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            error!("Email poll task ended abnormally: {e}");
        }
        self.inner.logout_all().await;
        self.inner.base.set_running(false);

        info!("Email channel stopped");
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if msg.is_check_command() {
            self.check_now();
            return Ok(());
        }

        let account = self
            .inner
            .config
            .accounts
            .first()
            .cloned()
            .ok_or_else(|| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: "no email accounts configured".into(),
            })?;

        let (subject, body) = extract_subject(&msg.content);
        let mail = OutgoingMail {
            to: msg.chat_id.clone(),
            subject,
            body: body.to_string(),
        };

        let smtp = Arc::clone(&self.inner.smtp);
        let from = account.email.clone();
        tokio::task::spawn_blocking(move || deliver(smtp.as_ref(), &account, &mail))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(|source| ChannelError::Transport {
                name: CHANNEL_NAME.into(),
                source,
            })?;

        info!(from = %from, to = %msg.chat_id, "Email sent");
        Ok(())
    }
}

#[cfg(test)]
#[path = "email_tests.rs"]
mod tests;

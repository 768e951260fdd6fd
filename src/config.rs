//! Configuration types, built from environment variables.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default poll interval for the email channel.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Message bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Inbound queue size before publishers start waiting.
    pub inbound_capacity: usize,
    /// How long a publisher waits on a full inbound queue.
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 100,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            inbound_capacity: env_parse("BUS_INBOUND_CAPACITY").unwrap_or(defaults.inbound_capacity),
            publish_timeout: env_parse("BUS_PUBLISH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_timeout),
        }
    }
}

/// One mailbox: where to read it and how to send from it.
#[derive(Debug, Clone)]
pub struct MailAccount {
    pub email: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_password: SecretString,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: SecretString,
}

/// Wire form of [`MailAccount`] inside `EMAIL_ACCOUNTS`.
#[derive(Debug, Deserialize)]
struct RawAccount {
    email: String,
    imap_host: String,
    #[serde(default = "default_imap_port")]
    imap_port: u16,
    imap_user: Option<String>,
    imap_password: String,
    smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
    smtp_user: Option<String>,
    smtp_password: Option<String>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

impl From<RawAccount> for MailAccount {
    fn from(raw: RawAccount) -> Self {
        let imap_user = raw.imap_user.unwrap_or_else(|| raw.email.clone());
        let smtp_host = raw
            .smtp_host
            .unwrap_or_else(|| raw.imap_host.replace("imap", "smtp"));
        let smtp_user = raw.smtp_user.unwrap_or_else(|| imap_user.clone());
        let smtp_password = raw
            .smtp_password
            .unwrap_or_else(|| raw.imap_password.clone());
        Self {
            email: raw.email,
            imap_host: raw.imap_host,
            imap_port: raw.imap_port,
            imap_user,
            imap_password: SecretString::from(raw.imap_password),
            smtp_host,
            smtp_port: raw.smtp_port,
            smtp_user,
            smtp_password: SecretString::from(smtp_password),
        }
    }
}

/// Where new-mail summaries are mirrored: `"<channel>:<chatID>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub channel: String,
    pub chat_id: String,
}

impl std::str::FromStr for ForwardTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((channel, chat_id)) if !channel.trim().is_empty() && !chat_id.trim().is_empty() => {
                Ok(Self {
                    channel: channel.trim().to_string(),
                    chat_id: chat_id.trim().to_string(),
                })
            }
            _ => Err(ConfigError::InvalidValue {
                key: "EMAIL_FORWARD_TO".into(),
                message: format!("expected \"<channel>:<chatID>\", got {s:?}"),
            }),
        }
    }
}

/// Email channel configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub accounts: Vec<MailAccount>,
    pub poll_interval: Duration,
    /// Sender addresses allowed through. Empty allows everyone.
    pub allow_from: Vec<String>,
    pub forward_to: Option<ForwardTarget>,
}

impl EmailConfig {
    pub fn new(accounts: Vec<MailAccount>) -> Self {
        Self {
            accounts,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            allow_from: Vec::new(),
            forward_to: None,
        }
    }

    /// Build config from environment variables.
    ///
    /// Returns `Ok(None)` when neither `EMAIL_ACCOUNTS` nor `EMAIL_IMAP_HOST`
    /// is set (channel disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let accounts = match std::env::var("EMAIL_ACCOUNTS") {
            Ok(json) => parse_accounts(&json)?,
            Err(_) => match legacy_account_from_env() {
                Some(account) => vec![account],
                None => return Ok(None),
            },
        };

        if accounts.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "EMAIL_ACCOUNTS".into(),
                hint: "Provide at least one account or unset the variable".into(),
            });
        }

        let poll_interval = Duration::from_secs(
            env_parse("EMAIL_POLL_INTERVAL_SECS").unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "EMAIL_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let allow_from = split_list(&std::env::var("EMAIL_ALLOW_FROM").unwrap_or_default());

        let forward_to = match std::env::var("EMAIL_FORWARD_TO") {
            Ok(s) if !s.trim().is_empty() => Some(s.parse()?),
            _ => None,
        };

        Ok(Some(Self {
            accounts,
            poll_interval,
            allow_from,
            forward_to,
        }))
    }

    /// Find a configured account by address, case-insensitively.
    pub fn account(&self, email: &str) -> Option<&MailAccount> {
        self.accounts
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
    }
}

/// Parse the `EMAIL_ACCOUNTS` JSON array.
pub fn parse_accounts(json: &str) -> Result<Vec<MailAccount>, ConfigError> {
    let raw: Vec<RawAccount> = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("EMAIL_ACCOUNTS: {e}")))?;
    Ok(raw
        .into_iter()
        .filter(|a| !a.email.trim().is_empty())
        .map(MailAccount::from)
        .collect())
}

/// Single-account fallback from the flat `EMAIL_*` variables.
fn legacy_account_from_env() -> Option<MailAccount> {
    let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;
    let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
    let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();

    Some(MailAccount::from(RawAccount {
        email: std::env::var("EMAIL_ADDRESS").unwrap_or_else(|_| username.clone()),
        imap_port: env_parse("EMAIL_IMAP_PORT").unwrap_or_else(default_imap_port),
        smtp_host: std::env::var("EMAIL_SMTP_HOST").ok(),
        smtp_port: env_parse("EMAIL_SMTP_PORT").unwrap_or_else(default_smtp_port),
        imap_host,
        imap_user: Some(username),
        imap_password: password,
        smtp_user: None,
        smtp_password: None,
    }))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

//! Error types for mailbus.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Transport error on channel {name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: MailError,
    },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Inbound queue full, gave up after {timeout:?}")]
    InboundFull { timeout: Duration },

    #[error("Inbound queue closed")]
    InboundClosed,

    #[error("Outbound queue closed")]
    OutboundClosed,

    #[error("No channel registered under {0}")]
    UnknownChannel(String),
}

/// How a mail-store or transport failure affects the owning account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The session is unusable; drop it and reconnect on the next tick.
    Connection,
    /// The session survives; abort the rest of this account's cycle.
    Protocol,
}

/// IMAP / SMTP level errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Login failed for {user}: {reason}")]
    Login { user: String, reason: String },

    #[error("Mailbox {mailbox} could not be selected: {reason}")]
    Select { mailbox: String, reason: String },

    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Malformed server response: {0}")]
    Protocol(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Response stream out of sync: {0}")]
    OutOfSync(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Classify the error for the per-account state machine.
    pub fn class(&self) -> ErrorClass {
        match self {
            MailError::Connect { .. }
            | MailError::Tls(_)
            | MailError::Login { .. }
            | MailError::Select { .. }
            | MailError::Closed
            | MailError::OutOfSync(_)
            | MailError::Io(_) => ErrorClass::Connection,
            MailError::Command { .. }
            | MailError::Protocol(_)
            | MailError::Smtp(_)
            | MailError::InvalidAddress { .. } => ErrorClass::Protocol,
        }
    }

    pub(crate) fn command(command: &str, reason: impl Into<String>) -> Self {
        MailError::Command {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} is disabled: {reason}")]
    Disabled { name: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_drop_the_session() {
        let err = MailError::Login {
            user: "a".into(),
            reason: "NO".into(),
        };
        assert_eq!(err.class(), ErrorClass::Connection);
        assert_eq!(MailError::Closed.class(), ErrorClass::Connection);
        assert_eq!(MailError::OutOfSync("+ ready".into()).class(), ErrorClass::Connection);
    }

    #[test]
    fn top_level_error_wraps_each_layer() {
        fn load() -> Result<()> {
            Err(ConfigError::ParseError("EMAIL_ACCOUNTS: eof".into()))?
        }
        let err = load().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: Failed to parse configuration: EMAIL_ACCOUNTS: eof"
        );

        let err: Error = ChannelError::from(BusError::InboundClosed).into();
        assert!(matches!(err, Error::Channel(ChannelError::Bus(_))));
    }

    #[test]
    fn command_failures_keep_the_session() {
        let err = MailError::command("UID SEARCH", "BAD");
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert_eq!(err.to_string(), "UID SEARCH failed: BAD");
    }
}

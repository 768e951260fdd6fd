//! Email tools: ask the email channel to poll, and send mail directly.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::email::CHANNEL_NAME as EMAIL_CHANNEL;
use crate::channels::smtp::{OutgoingMail, SmtpConnector, deliver};
use crate::config::{EmailConfig, MailAccount};
use crate::tools::tool::{Tool, ToolError, ToolResult, optional_str, require_str};

/// Requests an immediate poll of the email channel.
///
/// Goes through the bus, so it never holds a reference to the channel.
pub struct CheckEmailTool {
    bus: Arc<MessageBus>,
}

impl CheckEmailTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for CheckEmailTool {
    fn name(&self) -> &str {
        "check_email"
    }

    fn description(&self) -> &str {
        "Check all email accounts for new mail right now instead of waiting for the \
         next scheduled poll. New messages arrive as separate inbound messages."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: serde_json::Value) -> ToolResult {
        if self.bus.channel(EMAIL_CHANNEL).await.is_none() {
            return ToolError::Disabled {
                name: self.name().to_string(),
                reason: "email channel is not configured".into(),
            }
            .into();
        }

        match self.bus.publish_outbound(OutboundMessage::check(EMAIL_CHANNEL)) {
            Ok(()) => ToolResult::silent(
                "Email check requested. Any new mail will arrive as separate messages.",
            ),
            Err(e) => ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            }
            .into(),
        }
    }
}

/// Sends one email from a configured account.
pub struct SendEmailTool {
    config: Option<EmailConfig>,
    smtp: Arc<dyn SmtpConnector>,
}

impl SendEmailTool {
    /// `config` is `None` when email is not configured; every call then fails.
    pub fn new(config: Option<EmailConfig>, smtp: Arc<dyn SmtpConnector>) -> Self {
        Self { config, smtp }
    }

    fn select_account(&self, from: Option<&str>) -> Result<MailAccount, ToolError> {
        let config = self.config.as_ref().ok_or_else(|| ToolError::Disabled {
            name: self.name().to_string(),
            reason: "email is not configured".into(),
        })?;

        let account = match from {
            Some(from) => config.account(from).ok_or_else(|| ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: format!("no configured account for {from}"),
            })?,
            None => config.accounts.first().ok_or_else(|| ToolError::Disabled {
                name: self.name().to_string(),
                reason: "no email accounts configured".into(),
            })?,
        };
        Ok(account.clone())
    }

    async fn send(&self, params: &serde_json::Value) -> Result<ToolResult, ToolError> {
        let name = self.name();
        let to = require_str(name, params, "to")?;
        let subject = require_str(name, params, "subject")?;
        let body = params
            .get("body")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters {
                name: name.to_string(),
                reason: "missing required parameter 'body'".into(),
            })?;
        let account = self.select_account(optional_str(params, "from_account"))?;

        let mail = OutgoingMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        let from = account.email.clone();
        let smtp = Arc::clone(&self.smtp);

        tokio::task::spawn_blocking(move || deliver(smtp.as_ref(), &account, &mail))
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: name.to_string(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(|e| ToolError::ExecutionFailed {
                name: name.to_string(),
                reason: format!("failed to send email: {e}"),
            })?;

        info!(to = %to, from = %from, "Email sent via tool");
        Ok(
            ToolResult::new(format!("Email sent successfully to {to} using account {from}"))
                .with_user(format!("Sent email to {to} (via {from})")),
        )
    }
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send an email to a specific address."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": {
                    "type": "string",
                    "description": "Recipient email address (e.g. user@example.com)"
                },
                "subject": {
                    "type": "string",
                    "description": "Email subject"
                },
                "body": {
                    "type": "string",
                    "description": "Email body content"
                },
                "from_account": {
                    "type": "string",
                    "description": "Optional: address to send from. Must match a configured account."
                }
            },
            "required": ["to", "subject", "body"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> ToolResult {
        self.send(&params).await.unwrap_or_else(ToolResult::from)
    }
}

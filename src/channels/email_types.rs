//! Email-specific types: parsed messages, body extraction, and the text
//! shapes the channel publishes.

use chrono::{DateTime, TimeDelta, Utc};
use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};

use crate::bus::Attachment;

/// Unread mail older than this is left alone.
pub const STALE_AFTER: TimeDelta = TimeDelta::hours(1);

/// Longest body excerpt in a forwarded summary, in characters.
pub const FORWARD_BODY_LIMIT: usize = 500;

/// Subject used when outbound content does not carry one.
pub const DEFAULT_SUBJECT: &str = "Re: Your message";

/// A fetched message reduced to what the channel needs.
#[derive(Debug, Clone)]
pub struct ParsedMail {
    pub uid: u32,
    pub sender: Option<String>,
    pub subject: String,
    /// `Date` header; `None` when absent or unparseable.
    pub date: Option<DateTime<Utc>>,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl ParsedMail {
    /// Parse raw RFC 822 bytes. `None` if the bytes are not a message.
    pub fn parse(uid: u32, raw: &[u8]) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string());

        let date = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

        Some(Self {
            uid,
            sender,
            subject: parsed.subject().unwrap_or("(no subject)").to_string(),
            date,
            body: extract_body(&parsed),
            attachments: extract_attachments(&parsed),
        })
    }

    /// Dated more than [`STALE_AFTER`] before `now`. Undated mail is never stale.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.date.is_some_and(|d| now - d > STALE_AFTER)
    }
}

fn is_attachment(part: &MessagePart) -> bool {
    MimeHeaders::content_disposition(part)
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"))
}

fn is_text_plain(part: &MessagePart) -> bool {
    match MimeHeaders::content_type(part) {
        // No Content-Type means text/plain.
        None => true,
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_none_or(|s| s.eq_ignore_ascii_case("plain"))
        }
    }
}

/// Best-effort readable body.
///
/// Parts are walked in document order: the first inline `text/plain` part
/// wins. Failing that, the first inline textual part of any other subtype
/// is used, with HTML reduced to text. Otherwise the body is empty.
pub fn extract_body(parsed: &mail_parser::Message) -> String {
    let inline = || parsed.parts.iter().filter(|p| !is_attachment(p));

    for part in inline() {
        if let PartType::Text(text) = &part.body
            && is_text_plain(part)
        {
            return text.to_string();
        }
    }

    for part in inline() {
        match &part.body {
            PartType::Text(text) => return text.to_string(),
            PartType::Html(html) => return strip_html(html),
            _ => {}
        }
    }

    String::new()
}

fn extract_attachments(parsed: &mail_parser::Message) -> Vec<Attachment> {
    parsed
        .attachments()
        .map(|part| Attachment {
            name: MimeHeaders::attachment_name(part).map(str::to_string),
            content_type: MimeHeaders::content_type(part).map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            }),
            data: part.contents().to_vec(),
        })
        .collect()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split outbound content into subject and body.
///
/// If content starts with `Subject: ...` and has a following line, that
/// line is the subject and the rest the body. Otherwise [`DEFAULT_SUBJECT`].
pub fn extract_subject(content: &str) -> (String, &str) {
    if let Some(rest) = content.strip_prefix("Subject: ")
        && let Some(pos) = rest.find('\n')
    {
        let subject = rest[..pos].trim().to_string();
        let body = rest[pos + 1..].trim_start();
        return (subject, body);
    }
    (DEFAULT_SUBJECT.to_string(), content)
}

/// Keep at most `max` characters, marking any cut with `...`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Content handed to the agent loop for a received email.
pub fn inbound_content(account: &str, subject: &str, body: &str) -> String {
    format!("[Received at {account}]\nSubject: {subject}\n\n{body}")
}

/// Short notice mirrored to the forward target.
pub fn forward_summary(account: &str, sender: &str, subject: &str, body: &str) -> String {
    format!(
        "📧 **New Email [{account}]**\n**From:** {sender}\n**Subject:** {subject}\n\n{}",
        truncate_chars(body, FORWARD_BODY_LIMIT)
    )
}

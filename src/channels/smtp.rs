//! Outbound mail: the SMTP dialogue as discrete steps, and a lettre-backed
//! implementation of it.
//!
//! Port 465 negotiates TLS before the first SMTP command; every other port
//! greets in plaintext and upgrades with STARTTLS before authenticating.

use std::net::ToSocketAddrs;
use std::time::Duration;

use lettre::Message;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{SmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::MailAccount;
use crate::error::MailError;

/// Port on which SMTP is spoken over TLS from the first byte.
pub const SMTPS_PORT: u16 = 465;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How a session is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS handshake immediately after TCP connect.
    ImplicitTls,
    /// Plaintext EHLO, then STARTTLS.
    StartTls,
}

impl SmtpSecurity {
    pub fn for_port(port: u16) -> Self {
        if port == SMTPS_PORT {
            SmtpSecurity::ImplicitTls
        } else {
            SmtpSecurity::StartTls
        }
    }
}

/// Opens SMTP sessions.
pub trait SmtpConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn SmtpSession>, MailError>;
}

/// One SMTP session, driven step by step by [`deliver`].
pub trait SmtpSession: Send {
    fn tls_handshake(&mut self) -> Result<(), MailError>;
    fn ehlo(&mut self) -> Result<(), MailError>;
    fn starttls(&mut self) -> Result<(), MailError>;
    fn auth(&mut self, user: &str, password: &str) -> Result<(), MailError>;
    /// MAIL FROM, RCPT TO and DATA for one message.
    fn send(&mut self, envelope: &Envelope, message: &[u8]) -> Result<(), MailError>;
    fn quit(&mut self) -> Result<(), MailError>;
}

/// A message to send from an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Build the RFC 822 message.
pub fn build_message(account: &MailAccount, mail: &OutgoingMail) -> Result<Message, MailError> {
    let from = account
        .email
        .parse()
        .map_err(|e: lettre::address::AddressError| MailError::InvalidAddress {
            address: account.email.clone(),
            reason: e.to_string(),
        })?;
    let to = mail
        .to
        .parse()
        .map_err(|e: lettre::address::AddressError| MailError::InvalidAddress {
            address: mail.to.clone(),
            reason: e.to_string(),
        })?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(mail.subject.as_str())
        .body(mail.body.clone())
        .map_err(|e| MailError::Smtp(format!("failed to build message: {e}")))
}

/// Send one message. Any failing step aborts the send; there is no retry.
pub fn deliver(
    connector: &dyn SmtpConnector,
    account: &MailAccount,
    mail: &OutgoingMail,
) -> Result<(), MailError> {
    let message = build_message(account, mail)?;

    let mut session = connector.connect(&account.smtp_host, account.smtp_port)?;
    match SmtpSecurity::for_port(account.smtp_port) {
        SmtpSecurity::ImplicitTls => {
            session.tls_handshake()?;
            session.ehlo()?;
        }
        SmtpSecurity::StartTls => {
            session.ehlo()?;
            session.starttls()?;
        }
    }
    session.auth(&account.smtp_user, account.smtp_password.expose_secret())?;
    session.send(message.envelope(), &message.formatted())?;

    // The message is already accepted; a failed QUIT must not trigger a resend.
    if let Err(e) = session.quit() {
        warn!(host = %account.smtp_host, "SMTP QUIT failed after delivery: {e}");
    }
    debug!(to = %mail.to, from = %account.email, "SMTP delivery complete");
    Ok(())
}

// ── lettre implementation ───────────────────────────────────────────

/// [`SmtpConnector`] backed by lettre's low-level `SmtpConnection`.
pub struct LettreSmtp {
    timeout: Duration,
}

impl LettreSmtp {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for LettreSmtp {
    fn default() -> Self {
        Self::new()
    }
}

impl SmtpConnector for LettreSmtp {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn SmtpSession>, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: host.to_string(),
            port,
            reason,
        };
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("no address resolved".into()))?;

        Ok(Box::new(LettreSession {
            host: host.to_string(),
            addr,
            timeout: self.timeout,
            hello: ClientId::Domain("localhost".to_string()),
            implicit_tls: false,
            conn: None,
        }))
    }
}

/// lettre opens the socket, runs any implicit TLS handshake and sends EHLO
/// in one call, so the TCP connection is made at `ehlo`.
struct LettreSession {
    host: String,
    addr: std::net::SocketAddr,
    timeout: Duration,
    hello: ClientId,
    implicit_tls: bool,
    conn: Option<SmtpConnection>,
}

impl LettreSession {
    fn tls_parameters(&self) -> Result<TlsParameters, MailError> {
        TlsParameters::new(self.host.clone()).map_err(|e| MailError::Tls(e.to_string()))
    }

    fn conn(&mut self) -> Result<&mut SmtpConnection, MailError> {
        self.conn.as_mut().ok_or(MailError::Closed)
    }
}

fn smtp_err(e: lettre::transport::smtp::Error) -> MailError {
    MailError::Smtp(e.to_string())
}

impl SmtpSession for LettreSession {
    fn tls_handshake(&mut self) -> Result<(), MailError> {
        self.implicit_tls = true;
        Ok(())
    }

    fn ehlo(&mut self) -> Result<(), MailError> {
        let tls = if self.implicit_tls {
            Some(self.tls_parameters()?)
        } else {
            None
        };
        let conn = SmtpConnection::connect(
            self.addr,
            Some(self.timeout),
            &self.hello,
            tls.as_ref(),
            None,
        )
        .map_err(|e| MailError::Connect {
            host: self.host.clone(),
            port: self.addr.port(),
            reason: e.to_string(),
        })?;
        self.conn = Some(conn);
        Ok(())
    }

    fn starttls(&mut self) -> Result<(), MailError> {
        let params = self.tls_parameters()?;
        let hello = self.hello.clone();
        self.conn()?
            .starttls(&params, &hello)
            .map_err(|e| MailError::Tls(e.to_string()))
    }

    fn auth(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        let credentials = Credentials::new(user.to_string(), password.to_string());
        self.conn()?
            .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .map(|_| ())
            .map_err(smtp_err)
    }

    fn send(&mut self, envelope: &Envelope, message: &[u8]) -> Result<(), MailError> {
        self.conn()?
            .send(envelope, message)
            .map(|_| ())
            .map_err(smtp_err)
    }

    fn quit(&mut self) -> Result<(), MailError> {
        let result = self.conn()?.quit().map(|_| ()).map_err(smtp_err);
        self.conn = None;
        result
    }
}

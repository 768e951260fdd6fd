//! Mail-store access: the session traits the email channel polls through,
//! and a minimal IMAP4rev1 client that implements them.
//!
//! The client is blocking (std `TcpStream`, optionally wrapped in rustls)
//! and every call runs on the blocking pool, one account per session.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::MailAccount;
use crate::error::{ErrorClass, MailError};

/// Port on which IMAP is spoken over TLS from the first byte.
pub const IMAPS_PORT: u16 = 993;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One message as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMail {
    pub uid: u32,
    /// Full RFC 822 source.
    pub bytes: Vec<u8>,
}

/// Opens authenticated sessions to an account's mail store.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Connect and log in.
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, MailError>;
}

/// An authenticated mail-store session.
#[async_trait]
pub trait MailSession: Send {
    /// Select INBOX; returns the number of messages it holds.
    async fn select_inbox(&mut self) -> Result<u32, MailError>;

    /// UIDs of messages without the `\Seen` flag.
    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailError>;

    /// Fetch full messages without setting `\Seen`.
    async fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMail>, MailError>;

    /// Add the `\Seen` flag.
    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailError>;

    /// Best-effort logout; the session is unusable afterwards.
    async fn logout(&mut self);
}

// ── IMAP store ──────────────────────────────────────────────────────

/// [`MailStore`] backed by real IMAP servers.
pub struct ImapStore {
    timeout: Duration,
}

impl ImapStore {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ImapStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailStore for ImapStore {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailSession>, MailError> {
        let host = account.imap_host.clone();
        let port = account.imap_port;
        let user = account.imap_user.clone();
        let password = account.imap_password.clone();
        let timeout = self.timeout;

        let conn = tokio::task::spawn_blocking(move || {
            let mut conn = ImapConnection::open(&host, port, timeout)?;
            conn.login(&user, password.expose_secret())?;
            Ok::<_, MailError>(conn)
        })
        .await
        .map_err(join_error)??;

        Ok(Box::new(ImapSession { conn: Some(conn) }))
    }
}

/// Async facade over a blocking [`ImapConnection`].
struct ImapSession {
    /// `None` once the connection was lost inside a blocking task.
    conn: Option<ImapConnection>,
}

impl ImapSession {
    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, MailError>
    where
        F: FnOnce(&mut ImapConnection) -> Result<T, MailError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(MailError::Closed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(join_error)?;
        match &result {
            Err(e) if e.class() == ErrorClass::Connection => {
                debug!("Dropping IMAP connection after: {e}");
            }
            _ => self.conn = Some(conn),
        }
        result
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn select_inbox(&mut self) -> Result<u32, MailError> {
        self.with_conn(|c| c.select("INBOX")).await
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailError> {
        self.with_conn(ImapConnection::search_unseen).await
    }

    async fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMail>, MailError> {
        let uids = uids.to_vec();
        self.with_conn(move |c| c.fetch(&uids)).await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailError> {
        self.with_conn(move |c| c.mark_seen(uid)).await
    }

    async fn logout(&mut self) {
        if self.conn.is_some() {
            let _ = self.with_conn(|c| {
                c.logout();
                Ok(())
            })
            .await;
        }
        self.conn = None;
    }
}

fn join_error(e: tokio::task::JoinError) -> MailError {
    MailError::Io(std::io::Error::other(format!("IMAP task failed: {e}")))
}

// ── Blocking IMAP connection ────────────────────────────────────────

enum ImapStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ImapStream::Plain(s) => s.read(buf),
            ImapStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ImapStream::Plain(s) => s.write(buf),
            ImapStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ImapStream::Plain(s) => s.flush(),
            ImapStream::Tls(s) => s.flush(),
        }
    }
}

/// An untagged server response line together with any literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    line: String,
    literals: Vec<Vec<u8>>,
}

/// Completion of a tagged command.
#[derive(Debug)]
struct Response {
    untagged: Vec<Untagged>,
    ok: bool,
    text: String,
}

pub(crate) struct ImapConnection {
    reader: BufReader<ImapStream>,
    next_tag: u32,
}

impl ImapConnection {
    /// Connect and read the greeting. Port 993 uses TLS, anything else plaintext.
    pub(crate) fn open(host: &str, port: u16, timeout: Duration) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((host, port)).map_err(|e| MailError::Connect {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let stream = if port == IMAPS_PORT {
            ImapStream::Tls(Box::new(tls_stream(host, tcp)?))
        } else {
            ImapStream::Plain(tcp)
        };

        let mut conn = Self {
            reader: BufReader::new(stream),
            next_tag: 1,
        };

        let greeting = conn.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(MailError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        debug!(host = %host, port, "IMAP connected");
        Ok(conn)
    }

    pub(crate) fn login(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        let cmd = format!("LOGIN {} {}", quote(user), quote(password));
        let resp = self.command(&cmd)?;
        if !resp.ok {
            return Err(MailError::Login {
                user: user.to_string(),
                reason: resp.text,
            });
        }
        Ok(())
    }

    pub(crate) fn select(&mut self, mailbox: &str) -> Result<u32, MailError> {
        let resp = self.command(&format!("SELECT {}", quote(mailbox)))?;
        if !resp.ok {
            return Err(MailError::Select {
                mailbox: mailbox.to_string(),
                reason: resp.text,
            });
        }
        Ok(resp
            .untagged
            .iter()
            .find_map(|u| parse_exists(&u.line))
            .unwrap_or(0))
    }

    pub(crate) fn search_unseen(&mut self) -> Result<Vec<u32>, MailError> {
        let resp = self.command("UID SEARCH UNSEEN")?;
        if !resp.ok {
            return Err(MailError::command("UID SEARCH", resp.text));
        }
        Ok(resp
            .untagged
            .iter()
            .filter_map(|u| parse_search(&u.line))
            .flatten()
            .collect())
    }

    pub(crate) fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMail>, MailError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let resp = self.command(&format!("UID FETCH {set} (UID BODY.PEEK[])"))?;
        if !resp.ok {
            return Err(MailError::command("UID FETCH", resp.text));
        }
        Ok(resp
            .untagged
            .into_iter()
            .filter_map(|u| {
                let uid = parse_fetch_uid(&u.line)?;
                let bytes = u.literals.into_iter().next()?;
                Some(RawMail { uid, bytes })
            })
            .collect())
    }

    pub(crate) fn mark_seen(&mut self, uid: u32) -> Result<(), MailError> {
        let resp = self.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))?;
        if !resp.ok {
            return Err(MailError::command("UID STORE", resp.text));
        }
        Ok(())
    }

    pub(crate) fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }

    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.strip_prefix(&prefix) {
                let rest = rest.trim_end();
                let ok = rest.get(..2).is_some_and(|s| s.eq_ignore_ascii_case("OK"));
                return Ok(Response {
                    untagged,
                    ok,
                    text: rest.to_string(),
                });
            }
            // Continuation requests are not expected for the commands we send,
            // and the tagged reply is still pending on the wire.
            if line.starts_with('+') {
                return Err(MailError::OutOfSync(format!(
                    "unexpected continuation: {}",
                    line.trim_end()
                )));
            }
            untagged.push(self.read_literals(line)?);
        }
    }

    /// Complete an untagged response whose line announces `{n}` literals.
    fn read_literals(&mut self, first: String) -> Result<Untagged, MailError> {
        let mut resp = Untagged::default();
        let mut line = first;
        loop {
            match literal_len(&line) {
                Some(len) => {
                    let mut buf = vec![0u8; len];
                    self.reader.read_exact(&mut buf)?;
                    resp.literals.push(buf);
                    resp.line.push_str(&line);
                    line = self.read_line()?;
                }
                None => {
                    resp.line.push_str(&line);
                    return Ok(resp);
                }
            }
        }
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailError::Closed);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn tls_stream(
    host: &str,
    tcp: TcpStream,
) -> Result<rustls::StreamOwned<rustls::ClientConnection, TcpStream>, MailError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| MailError::Tls(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| MailError::Tls(format!("invalid server name {host}: {e}")))?;
    let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|e| MailError::Tls(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

// ── Response parsing ────────────────────────────────────────────────

/// Quote a string as an IMAP quoted-string.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// `* 12 EXISTS` → 12
fn parse_exists(line: &str) -> Option<u32> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "*" {
        return None;
    }
    let n = parts.next()?.parse().ok()?;
    parts
        .next()
        .filter(|w| w.eq_ignore_ascii_case("EXISTS"))
        .map(|_| n)
}

/// `* SEARCH 3 5 8` → [3, 5, 8]
fn parse_search(line: &str) -> Option<Vec<u32>> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "*" || !parts.next()?.eq_ignore_ascii_case("SEARCH") {
        return None;
    }
    Some(parts.filter_map(|p| p.parse().ok()).collect())
}

/// `* 4 FETCH (UID 17 BODY[] {342}` → 17
fn parse_fetch_uid(line: &str) -> Option<u32> {
    let upper = line.to_ascii_uppercase();
    if !upper.contains(" FETCH ") {
        return None;
    }
    let idx = upper.find("UID ")?;
    line[idx + 4..]
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

/// Trailing `{n}` literal marker on a response line.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let open = trimmed.strip_suffix('}')?.rfind('{')?;
    trimmed[open + 1..trimmed.len() - 1].parse().ok()
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    use secrecy::SecretString;

    use super::*;

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn parse_exists_line() {
        assert_eq!(parse_exists("* 12 EXISTS\r\n"), Some(12));
        assert_eq!(parse_exists("* 0 exists\r\n"), Some(0));
        assert_eq!(parse_exists("* 3 RECENT\r\n"), None);
        assert_eq!(parse_exists("* OK [UIDVALIDITY 1]\r\n"), None);
    }

    #[test]
    fn parse_search_line() {
        assert_eq!(parse_search("* SEARCH 3 5 8\r\n"), Some(vec![3, 5, 8]));
        assert_eq!(parse_search("* SEARCH\r\n"), Some(vec![]));
        assert_eq!(parse_search("* 5 EXISTS\r\n"), None);
    }

    #[test]
    fn parse_fetch_uid_in_either_position() {
        assert_eq!(parse_fetch_uid("* 4 FETCH (UID 17 BODY[] {342}\r\n"), Some(17));
        assert_eq!(parse_fetch_uid("* 4 FETCH (BODY[] {10}) UID 9)\r\n"), Some(9));
        assert_eq!(parse_fetch_uid("* 4 EXISTS\r\n"), None);
    }

    #[test]
    fn literal_marker() {
        assert_eq!(literal_len("* 1 FETCH (UID 2 BODY[] {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 2)\r\n"), None);
        assert_eq!(literal_len("{abc}\r\n"), None);
    }

    /// Scripted plaintext IMAP server for one session.
    fn spawn_server(mail: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writer.write_all(b"* OK IMAP4rev1 ready\r\n").unwrap();
            let mut seen = false;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                let mut words = line.split_whitespace();
                let tag = words.next().unwrap().to_string();
                let rest: Vec<&str> = words.collect();
                let reply = match rest.as_slice() {
                    ["LOGIN", user, _] if *user == "\"me\"" => format!("{tag} OK LOGIN done\r\n"),
                    ["LOGIN", ..] => format!("{tag} NO bad credentials\r\n"),
                    ["SELECT", ..] => format!("* 1 EXISTS\r\n* 1 RECENT\r\n{tag} OK [READ-WRITE] SELECT\r\n"),
                    ["UID", "SEARCH", "UNSEEN"] if seen => format!("* SEARCH\r\n{tag} OK SEARCH\r\n"),
                    ["UID", "SEARCH", "UNSEEN"] => format!("* SEARCH 7\r\n{tag} OK SEARCH\r\n"),
                    ["UID", "FETCH", "7", ..] => format!(
                        "* 1 FETCH (UID 7 BODY[] {{{}}}\r\n{mail})\r\n{tag} OK FETCH\r\n",
                        mail.len()
                    ),
                    ["UID", "STORE", "7", ..] => {
                        seen = true;
                        format!("{tag} OK STORE\r\n")
                    }
                    ["LOGOUT"] => {
                        writer.write_all(format!("* BYE\r\n{tag} OK LOGOUT\r\n").as_bytes()).unwrap();
                        return;
                    }
                    _ => format!("{tag} BAD unknown\r\n"),
                };
                writer.write_all(reply.as_bytes()).unwrap();
            }
        });
        port
    }

    fn account(port: u16, user: &str) -> MailAccount {
        MailAccount {
            email: "me@example.com".into(),
            imap_host: "127.0.0.1".into(),
            imap_port: port,
            imap_user: user.into(),
            imap_password: SecretString::from("secret".to_string()),
            smtp_host: "127.0.0.1".into(),
            smtp_port: 587,
            smtp_user: user.into(),
            smtp_password: SecretString::from("secret".to_string()),
        }
    }

    #[tokio::test]
    async fn imap_session_against_scripted_server() {
        let mail = "From: a@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let port = spawn_server(mail);
        let store = ImapStore::with_timeout(Duration::from_secs(5));

        let mut session = store.connect(&account(port, "me")).await.unwrap();
        assert_eq!(session.select_inbox().await.unwrap(), 1);
        assert_eq!(session.search_unseen().await.unwrap(), vec![7]);

        let fetched = session.fetch(&[7]).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].uid, 7);
        assert_eq!(fetched[0].bytes, mail.as_bytes());

        session.mark_seen(7).await.unwrap();
        assert!(session.search_unseen().await.unwrap().is_empty());
        session.logout().await;
        assert!(matches!(session.select_inbox().await, Err(MailError::Closed)));
    }

    #[tokio::test]
    async fn imap_login_rejection_is_a_connection_error() {
        let port = spawn_server("");
        let store = ImapStore::with_timeout(Duration::from_secs(5));
        let err = match store.connect(&account(port, "intruder")).await {
            Ok(_) => panic!("login should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, MailError::Login { .. }));
        assert_eq!(err.class(), ErrorClass::Connection);
    }

    #[tokio::test]
    async fn unexpected_continuation_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writer.write_all(b"* OK ready\r\n").unwrap();
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let tag = line.split_whitespace().next().unwrap().to_string();
                let reply = if line.contains("LOGIN") {
                    format!("{tag} OK LOGIN done\r\n")
                } else {
                    format!("+ go ahead\r\n* 3 EXISTS\r\n{tag} OK SELECT\r\n")
                };
                writer.write_all(reply.as_bytes()).unwrap();
                line.clear();
            }
        });
        let store = ImapStore::with_timeout(Duration::from_secs(5));

        let mut session = store.connect(&account(port, "me")).await.unwrap();
        let err = session.select_inbox().await.unwrap_err();
        assert!(matches!(err, MailError::OutOfSync(_)));
        assert_eq!(err.class(), ErrorClass::Connection);
        // The half-read reply is never mistaken for the next command's answer.
        assert!(matches!(session.search_unseen().await, Err(MailError::Closed)));
    }
}

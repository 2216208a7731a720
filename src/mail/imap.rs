//! IMAP mailbox — fetches messages and applies rule actions.
//!
//! Speaks IMAP4rev1 directly over a rustls TLS stream. All socket I/O is
//! blocking and runs on `spawn_blocking`. Each fetch or action opens its own
//! session, so a dropped connection never outlives one call.

use std::collections::BTreeSet;
use std::io::{Read as IoRead, Write as IoWrite};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::config::{env_parse, env_string};
use crate::dispatch::ActionExecutor;
use crate::error::{ActionError, ConfigError, MailError};
use crate::mail::MailClient;
use crate::message::{Message, RawMessage, fields};
use crate::rules::Action;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Label added to messages that lack the `\Seen` flag.
pub const UNREAD_LABEL: &str = "UNREAD";

// ── Configuration ───────────────────────────────────────────────────

/// IMAP connection settings, built from environment variables.
#[derive(Debug)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Mailbox scanned for messages and searched when applying actions.
    pub mailbox: String,
}

impl ImapConfig {
    /// Build config from `IMAP_*` environment variables.
    ///
    /// `IMAP_HOST` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host =
            env_string("IMAP_HOST").ok_or_else(|| ConfigError::MissingEnvVar("IMAP_HOST".into()))?;

        Ok(Self {
            host,
            port: env_parse::<u16>("IMAP_PORT")?.unwrap_or(993),
            username: env_string("IMAP_USERNAME").unwrap_or_default(),
            password: SecretString::from(std::env::var("IMAP_PASSWORD").unwrap_or_default()),
            mailbox: env_string("IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP-backed mail client and action executor.
#[derive(Clone)]
pub struct ImapMailbox {
    config: Arc<ImapConfig>,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailClient for ImapMailbox {
    async fn fetch_batch(&self, max_results: usize) -> Result<Vec<RawMessage>, MailError> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || fetch_newest(&config, max_results))
            .await
            .map_err(|e| MailError::Protocol(format!("IMAP fetch task failed: {e}")))?
    }
}

#[async_trait]
impl ActionExecutor for ImapMailbox {
    async fn execute(&self, action: &Action, message: &Message) -> Result<(), ActionError> {
        let config = Arc::clone(&self.config);
        let action = action.clone();
        let message_id = message.message_id.clone();
        tokio::task::spawn_blocking(move || apply_action(&config, &action, &message_id))
            .await
            .map_err(|e| MailError::Protocol(format!("IMAP action task failed: {e}")))?
    }
}

// ── Blocking operations ─────────────────────────────────────────────

/// Fetch the newest `max_results` messages of the configured mailbox.
fn fetch_newest(config: &ImapConfig, max_results: usize) -> Result<Vec<RawMessage>, MailError> {
    let mut session = Session::open(config)?;
    // EXAMINE is read-only, and BODY.PEEK[] leaves \Seen untouched.
    let status = session.open_mailbox(&config.mailbox, true)?;

    let Some(range) = fetch_range(status.exists, max_results) else {
        session.logout();
        return Ok(Vec::new());
    };

    let completion = session
        .command(&format!("FETCH {range} (UID FLAGS INTERNALDATE BODY.PEEK[])"))?
        .ensure_ok("FETCH")?;
    session.logout();

    let mut messages = Vec::new();
    for response in &completion.untagged {
        let Some(item) = FetchItem::parse(response) else {
            continue;
        };
        match item.to_message(status.uid_validity, &config.mailbox) {
            Some(message) => messages.push(message),
            None => warn!(uid = item.uid, "Skipping unparsable message"),
        }
    }

    info!(
        mailbox = %config.mailbox,
        fetched = messages.len(),
        "Fetched messages"
    );
    Ok(messages)
}

/// Apply one action to the message with the given id.
fn apply_action(config: &ImapConfig, action: &Action, message_id: &str) -> Result<(), ActionError> {
    let mut session = Session::open(config)?;
    let status = session.open_mailbox(&config.mailbox, false)?;
    let uids = session.locate(message_id, status.uid_validity)?;

    if uids.is_empty() {
        session.logout();
        return match action {
            Action::MoveMessage { mailbox } => {
                debug!(message_id, mailbox = %mailbox, "Message already moved");
                Ok(())
            }
            _ => Err(ActionError::MessageNotFound {
                message_id: message_id.to_string(),
            }),
        };
    }

    let set = uid_set(&uids);
    let command = match action {
        Action::MarkAsRead => format!("UID STORE {set} +FLAGS.SILENT (\\Seen)"),
        Action::MarkAsUnread => format!("UID STORE {set} -FLAGS.SILENT (\\Seen)"),
        Action::AddLabel { label } => {
            format!("UID STORE {set} +FLAGS.SILENT ({})", keyword(label))
        }
        Action::MoveMessage { mailbox } => format!("UID MOVE {set} {}", quote(mailbox)),
    };

    let completion = session.command(&command)?;
    session.logout();

    if completion.is_ok() {
        debug!(message_id, action = action.label(), "IMAP action applied");
        Ok(())
    } else {
        Err(ActionError::Failed {
            action: action.label().to_string(),
            reason: completion.status,
        })
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One untagged response line, with the literals it carried.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Responses to one tagged command.
#[derive(Debug)]
struct Completion {
    untagged: Vec<Untagged>,
    /// Tagged status line without the tag, e.g. `OK FETCH completed`.
    status: String,
}

impl Completion {
    fn is_ok(&self) -> bool {
        self.status.starts_with("OK")
    }

    fn ensure_ok(self, what: &str) -> Result<Self, MailError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(MailError::Protocol(format!("{what}: {}", self.status)))
        }
    }
}

/// State reported when a mailbox is opened.
#[derive(Debug, Default, PartialEq, Eq)]
struct MailboxStatus {
    exists: u32,
    uid_validity: Option<u32>,
}

struct Session {
    tls: TlsStream,
    next_tag: u32,
}

impl Session {
    /// Connect, read the greeting and log in.
    fn open(config: &ImapConfig) -> Result<Self, MailError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| MailError::Protocol(format!("TLS setup failed: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| MailError::Protocol(format!("Invalid IMAP host name: {e}")))?;
        let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
            .map_err(|e| MailError::Protocol(format!("TLS handshake failed: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with(b"* OK") && !greeting.starts_with(b"* PREAUTH") {
            return Err(MailError::Protocol(format!(
                "Unexpected greeting: {}",
                String::from_utf8_lossy(&greeting).trim_end()
            )));
        }

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !login.is_ok() {
            return Err(MailError::Auth(login.status));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => {
                    return Err(MailError::TransientNetwork(
                        "IMAP connection closed".into(),
                    ));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect responses until its completion.
    fn command(&mut self, cmd: &str) -> Result<Completion, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            let text = String::from_utf8_lossy(&line).into_owned();
            if let Some(status) = text.strip_prefix(&prefix) {
                return Ok(Completion {
                    untagged,
                    status: status.trim_end().to_string(),
                });
            }

            let mut response = Untagged {
                text,
                literals: Vec::new(),
            };
            while let Some(len) = literal_len(&response.text) {
                let mut literal = vec![0u8; len];
                self.tls.read_exact(&mut literal)?;
                response.literals.push(literal);
                let rest = self.read_line()?;
                response.text.push_str(&String::from_utf8_lossy(&rest));
            }
            untagged.push(response);
        }
    }

    fn open_mailbox(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxStatus, MailError> {
        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        let completion = self
            .command(&format!("{verb} {}", quote(mailbox)))?
            .ensure_ok(verb)?;
        Ok(parse_mailbox_status(&completion.untagged))
    }

    /// UIDs of the message with this id in the open mailbox.
    fn locate(&mut self, message_id: &str, uid_validity: Option<u32>) -> Result<Vec<u32>, MailError> {
        if let Some((validity, uid)) = parse_fallback_id(message_id) {
            return Ok(if uid_validity == Some(validity) {
                vec![uid]
            } else {
                Vec::new()
            });
        }
        let completion = self
            .command(&format!("UID SEARCH HEADER Message-ID {}", quote(message_id)))?
            .ensure_ok("SEARCH")?;
        Ok(parse_search(&completion.untagged))
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Quote a string as an IMAP quoted string.
pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Turn a label into an IMAP keyword atom.
pub fn keyword(label: &str) -> String {
    let atom: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && !"(){%*\"\\]".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    if atom.is_empty() {
        "_".to_string()
    } else {
        atom
    }
}

/// Sequence range covering the newest `max_results` of `exists` messages.
pub fn fetch_range(exists: u32, max_results: usize) -> Option<String> {
    if exists == 0 || max_results == 0 {
        return None;
    }
    let count = u32::try_from(max_results).unwrap_or(u32::MAX);
    let low = exists.saturating_sub(count - 1).max(1);
    Some(format!("{low}:{exists}"))
}

/// Stable id for a message without a `Message-ID` header.
pub fn fallback_id(uid_validity: Option<u32>, uid: u32) -> String {
    format!("uid:{}:{uid}", uid_validity.unwrap_or(0))
}

fn parse_fallback_id(message_id: &str) -> Option<(u32, u32)> {
    let rest = message_id.strip_prefix("uid:")?;
    let (validity, uid) = rest.split_once(':')?;
    Some((validity.parse().ok()?, uid.parse().ok()?))
}

/// Map IMAP flags to labels.
///
/// System flags lose their backslash and are uppercased (`\Seen` becomes
/// `SEEN`); keywords are kept as-is. A message without `\Seen` also gets
/// [`UNREAD_LABEL`].
pub fn flags_to_labels<S: AsRef<str>>(flags: &[S]) -> BTreeSet<String> {
    let mut labels = BTreeSet::new();
    let mut seen = false;
    for flag in flags {
        let flag = flag.as_ref();
        match flag.strip_prefix('\\') {
            Some(system) => {
                if system.eq_ignore_ascii_case("seen") {
                    seen = true;
                }
                labels.insert(system.to_ascii_uppercase());
            }
            None => {
                labels.insert(flag.to_string());
            }
        }
    }
    if !seen {
        labels.insert(UNREAD_LABEL.to_string());
    }
    labels
}

/// Parse an IMAP `INTERNALDATE` value such as `17-Jul-1996 02:44:25 -0700`.
pub fn parse_internal_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Length of a literal announced at the end of a response line (`{123}`).
fn literal_len(text: &str) -> Option<usize> {
    let line = text.trim_end_matches("\r\n");
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

fn parse_mailbox_status(untagged: &[Untagged]) -> MailboxStatus {
    let mut status = MailboxStatus::default();
    for response in untagged {
        let text = response.text.trim_end();
        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() >= 3 && parts[0] == "*" && parts[2].eq_ignore_ascii_case("EXISTS") {
            status.exists = parts[1].parse().unwrap_or(0);
        }
        if let Some(pos) = text.find("[UIDVALIDITY ") {
            let digits: String = text[pos + 13..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            status.uid_validity = digits.parse().ok();
        }
    }
    status
}

fn parse_search(untagged: &[Untagged]) -> Vec<u32> {
    untagged
        .iter()
        .filter_map(|r| r.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// One `* n FETCH (...)` response.
#[derive(Debug)]
struct FetchItem<'a> {
    uid: u32,
    flags: Vec<&'a str>,
    internal_date: Option<&'a str>,
    raw: &'a [u8],
}

impl<'a> FetchItem<'a> {
    fn parse(response: &'a Untagged) -> Option<Self> {
        let text = response.text.as_str();
        if !text.starts_with('*') || !text.contains(" FETCH (") {
            return None;
        }

        let uid = text
            .find("UID ")
            .map(|pos| &text[pos + 4..])
            .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|n| n.parse().ok())?;

        let flags = text
            .find("FLAGS (")
            .and_then(|pos| {
                let rest = &text[pos + 7..];
                rest.find(')').map(|end| rest[..end].split_whitespace().collect())
            })
            .unwrap_or_default();

        let internal_date = text.find("INTERNALDATE \"").and_then(|pos| {
            let rest = &text[pos + 14..];
            rest.find('"').map(|end| &rest[..end])
        });

        Some(Self {
            uid,
            flags,
            internal_date,
            raw: response.literals.first()?.as_slice(),
        })
    }

    fn to_message(&self, uid_validity: Option<u32>, mailbox: &str) -> Option<Message> {
        let parsed = MessageParser::default().parse(self.raw)?;

        let message_id = parsed
            .message_id()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| fallback_id(uid_validity, self.uid));

        let received_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .or_else(|| self.internal_date.and_then(parse_internal_date));

        let mut message = Message::new(message_id)
            .with(fields::LABELS, flags_to_labels(&self.flags))
            .with(fields::MAILBOX, mailbox)
            .with(fields::BODY, extract_text(&parsed));

        if let Some(sender) = parsed.from().and_then(format_addresses) {
            message = message.with(fields::SENDER, sender);
        }
        if let Some(recipient) = parsed.to().and_then(format_addresses) {
            message = message.with(fields::RECIPIENT, recipient);
        }
        if let Some(subject) = parsed.subject() {
            message = message.with(fields::SUBJECT, subject);
        }
        if let Some(ts) = received_at {
            message = message.with(fields::RECEIVED_AT, ts);
        }
        Some(message)
    }
}

/// Render an address header as `Name <addr>, ...`.
fn format_addresses(address: &mail_parser::Address) -> Option<String> {
    let rendered: Vec<String> = address
        .iter()
        .filter_map(|addr| match (addr.name(), addr.address()) {
            (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
            (None, Some(email)) => Some(email.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        })
        .collect();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered.join(", "))
    }
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

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

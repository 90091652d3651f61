//! Mailbox access abstraction: trait + IMAP and mock implementations.
//!
//! `MailSource` is the poller's only view of a mailbox: UID searches and raw
//! RFC 5322 fetches over `INBOX`. The IMAP implementation opens a fresh TLS
//! session per operation, so a dropped connection never wedges the poll loop —
//! the next tick simply reconnects.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::config::ImapConfig;
use crate::error::MailError;

/// IMAPS port.
const IMAP_PORT: u16 = 993;

/// Result type for mailbox operations.
pub type MailResult<T> = std::result::Result<T, MailError>;

/// One message pulled from the mailbox.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Raw RFC 5322 bytes.
    pub data: Vec<u8>,
}

// ── MailSource trait ────────────────────────────────────────────────────

/// Capability surface over one mailbox.
///
/// Implementations must be `Send` so a poller can own one per worker thread.
/// All searches return UIDs in ascending order.
pub trait MailSource: Send {
    /// UIDs of messages received on or after `since` (IMAP `SEARCH SINCE`).
    fn search_since(&mut self, since: NaiveDate) -> MailResult<Vec<u32>>;

    /// UIDs strictly above `last_uid` (IMAP `UID SEARCH UID last+1:*`).
    ///
    /// The server returns the newest message even when nothing is above the
    /// range start, so the result is filtered to `> last_uid`.
    fn search_above(&mut self, last_uid: u32) -> MailResult<Vec<u32>>;

    /// Fetch full messages for `uids`, ascending. UIDs that vanished from the
    /// mailbox between search and fetch are silently absent from the result.
    fn fetch_batch(&mut self, uids: &[u32]) -> MailResult<Vec<FetchedMessage>>;
}

// ── ImapMailSource ──────────────────────────────────────────────────────

/// IMAP implementation using the `imap` crate (sync, TLS).
pub struct ImapMailSource {
    config: ImapConfig,
}

impl ImapMailSource {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    /// Establish a TLS connection, login, and select INBOX read-only.
    fn session(
        &self,
    ) -> MailResult<imap::Session<native_tls::TlsStream<std::net::TcpStream>>> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Connection {
                message: format!("TLS connector build failed: {e}"),
            })?;

        let addr = (&*self.config.server, IMAP_PORT);
        let client = imap::connect(addr, &self.config.server, &tls).map_err(|e| {
            MailError::Connection {
                message: format!("connect to {} failed: {e}", self.config.server),
            }
        })?;

        let mut session = client
            .login(&self.config.user, &self.config.password)
            .map_err(|e| MailError::Authentication {
                user: format!("{} ({})", self.config.user, e.0),
            })?;

        // EXAMINE keeps \Seen flags untouched.
        session.examine("INBOX").map_err(|e| MailError::Protocol {
            message: format!("EXAMINE INBOX failed: {e}"),
        })?;

        Ok(session)
    }

    fn uid_search(&mut self, query: &str) -> MailResult<Vec<u32>> {
        let mut session = self.session()?;
        let uids = session.uid_search(query).map_err(|e| MailError::Protocol {
            message: format!("UID SEARCH {query} failed: {e}"),
        })?;
        session.logout().ok();

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }
}

impl std::fmt::Debug for ImapMailSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailSource")
            .field("server", &self.config.server)
            .field("user", &self.config.user)
            .finish()
    }
}

impl MailSource for ImapMailSource {
    fn search_since(&mut self, since: NaiveDate) -> MailResult<Vec<u32>> {
        // IMAP date-text, e.g. "08-May-2025".
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        self.uid_search(&query)
    }

    fn search_above(&mut self, last_uid: u32) -> MailResult<Vec<u32>> {
        let query = format!("UID {}:*", last_uid.saturating_add(1));
        let uids = self.uid_search(&query)?;
        Ok(uids.into_iter().filter(|&u| u > last_uid).collect())
    }

    fn fetch_batch(&mut self, uids: &[u32]) -> MailResult<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self.session()?;
        let uid_set: String = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches = session
            .uid_fetch(&uid_set, "RFC822")
            .map_err(|e| MailError::Protocol {
                message: format!("UID FETCH failed: {e}"),
            })?;

        let mut messages = Vec::new();
        for fetch in fetches.iter() {
            if let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) {
                messages.push(FetchedMessage {
                    uid,
                    data: body.to_vec(),
                });
            }
        }
        session.logout().ok();

        messages.sort_unstable_by_key(|m| m.uid);
        Ok(messages)
    }
}

// ── MockMailSource ──────────────────────────────────────────────────────

/// In-memory mailbox for unit testing.
#[derive(Debug, Default)]
pub struct MockMailSource {
    messages: BTreeMap<u32, Vec<u8>>,
    /// When set, the next operation fails once with a connection error.
    fail_next: bool,
}

impl MockMailSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a message in the mailbox.
    pub fn push(&mut self, uid: u32, data: impl Into<Vec<u8>>) {
        self.messages.insert(uid, data.into());
    }

    /// Make the next operation fail with a transient connection error.
    pub fn fail_next(&mut self) {
        self.fail_next = true;
    }

    fn check_failure(&mut self) -> MailResult<()> {
        if self.fail_next {
            self.fail_next = false;
            return Err(MailError::Connection {
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl MailSource for MockMailSource {
    fn search_since(&mut self, _since: NaiveDate) -> MailResult<Vec<u32>> {
        self.check_failure()?;
        Ok(self.messages.keys().copied().collect())
    }

    fn search_above(&mut self, last_uid: u32) -> MailResult<Vec<u32>> {
        self.check_failure()?;
        Ok(self
            .messages
            .range(last_uid.saturating_add(1)..)
            .map(|(&uid, _)| uid)
            .collect())
    }

    fn fetch_batch(&mut self, uids: &[u32]) -> MailResult<Vec<FetchedMessage>> {
        self.check_failure()?;
        Ok(uids
            .iter()
            .filter_map(|uid| {
                self.messages.get(uid).map(|data| FetchedMessage {
                    uid: *uid,
                    data: data.clone(),
                })
            })
            .collect())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

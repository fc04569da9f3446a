use anyhow::{Context, Result};
use native_tls::TlsConnector;
use std::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ImapConfig;
use crate::message::{parse_message, MailMessage};

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

/// What to do with a message on the server once the run has processed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark \Seen so the next UNSEEN search skips it.
    MarkSeen,
    /// Flag \Deleted; expunged at the end of the run.
    Delete,
    /// Leave untouched so the next run retries it.
    Keep,
}

/// TLS IMAP session scoped to one run. Connect, fetch, apply flags,
/// logout; the session is released on every exit path via `logout` or drop.
pub struct Mailbox {
    session: ImapSession,
    mailbox: String,
    from_filter: Option<String>,
    uid_validity: u32,
}

impl Mailbox {
    /// Connect and authenticate. An authentication failure here is fatal
    /// for the run.
    pub fn connect(config: &ImapConfig) -> Result<Self> {
        let tls = TlsConnector::builder()
            .build()
            .context("Failed to build TLS connector")?;

        info!("Connecting to {}:{}", config.server, config.port);
        let client = imap::connect(
            (config.server.as_str(), config.port),
            config.server.as_str(),
            &tls,
        )
        .with_context(|| format!("Failed to connect to {}:{}", config.server, config.port))?;

        let session = client
            .login(&config.user, &config.password)
            .map_err(|(e, _)| e)
            .with_context(|| format!("Mailbox authentication failed for {}", config.user))?;
        info!("Logged in as {}", config.user);

        Ok(Self {
            session,
            mailbox: config.mailbox.clone(),
            from_filter: config.from_filter.clone(),
            uid_validity: 0,
        })
    }

    /// UIDVALIDITY of the selected mailbox. Valid after `fetch_unseen`.
    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn name(&self) -> &str {
        &self.mailbox
    }

    /// Select the mailbox and fetch all UNSEEN messages (optionally
    /// restricted to the configured sender), parsed and sorted by UID.
    pub fn fetch_unseen(&mut self) -> Result<Vec<MailMessage>> {
        let selected = self
            .session
            .select(&self.mailbox)
            .with_context(|| format!("Failed to select mailbox {}", self.mailbox))?;
        self.uid_validity = selected.uid_validity.unwrap_or(0);

        let query = match &self.from_filter {
            Some(from) => format!("UNSEEN FROM \"{}\"", from),
            None => "UNSEEN".to_string(),
        };
        let mut uids: Vec<u32> = self
            .session
            .uid_search(&query)
            .with_context(|| format!("UID search failed: {}", query))?
            .into_iter()
            .collect();
        uids.sort_unstable();
        debug!("UNSEEN uids in {}: {:?}", self.mailbox, uids);

        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let sequence = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = self
            .session
            .uid_fetch(&sequence, "(UID RFC822)")
            .context("Failed to fetch messages")?;

        let mut messages = Vec::new();
        for fetch in fetches.iter() {
            let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) else {
                continue;
            };
            match parse_message(uid, body) {
                Ok(msg) => messages.push(msg),
                // A single unparseable message must not abort the run.
                Err(e) => warn!("Skipping unparseable message uid {}: {:#}", uid, e),
            }
        }
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    /// Apply per-message dispositions: \Seen and \Deleted flags, then a
    /// single expunge if anything was deleted.
    pub fn apply(&mut self, dispositions: &[(u32, Disposition)]) -> Result<()> {
        let seen = join_uids(dispositions, Disposition::MarkSeen);
        let deleted = join_uids(dispositions, Disposition::Delete);

        if let Some(seq) = seen {
            self.session
                .uid_store(&seq, "+FLAGS (\\Seen)")
                .with_context(|| format!("Failed to mark \\Seen: {}", seq))?;
        }
        if let Some(seq) = deleted {
            self.session
                .uid_store(&seq, "+FLAGS (\\Deleted)")
                .with_context(|| format!("Failed to mark \\Deleted: {}", seq))?;
            self.session.expunge().context("Failed to expunge")?;
        }
        Ok(())
    }

    /// End the session. The server closes the connection either way, but a
    /// clean LOGOUT avoids dangling server-side state.
    pub fn logout(mut self) -> Result<()> {
        self.session.logout().context("Failed to log out")?;
        Ok(())
    }
}

fn join_uids(dispositions: &[(u32, Disposition)], which: Disposition) -> Option<String> {
    let uids: Vec<String> = dispositions
        .iter()
        .filter(|(_, d)| *d == which)
        .map(|(uid, _)| uid.to_string())
        .collect();
    if uids.is_empty() {
        None
    } else {
        Some(uids.join(","))
    }
}

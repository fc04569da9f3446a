use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ImapConfig, MatchingConfig};
use crate::mailbox::{Disposition, Mailbox};
use crate::matcher::TermMatcher;
use crate::message::MailMessage;
use crate::notify::{format_alert, Notifier};
use crate::seen::{NotifiedMessage, SeenStore};

/// Bound on body links probed per message when no direct match is found.
const MAX_LINK_PROBES: usize = 5;
const LINK_TIMEOUT: Duration = Duration::from_secs(10);
const LINK_USER_AGENT: &str = "Mozilla/5.0 (compatible; mailwatch)";

/// Per-run counters, logged at the end of every invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunReport {
    pub fetched: usize,
    /// Already recorded in the seen-state store.
    pub skipped: usize,
    pub matched: usize,
    pub notified: usize,
    /// Matched messages whose notification failed; left for retry.
    pub failed: usize,
}

/// What one fetch pass produced: mailbox identity plus parsed messages.
pub(crate) struct FetchBatch {
    pub mailbox: String,
    pub uid_validity: u32,
    pub messages: Vec<MailMessage>,
}

/// Mailbox seam mirroring `Notifier`. The real implementation drives a
/// blocking IMAP session on spawn_blocking tasks.
#[async_trait]
pub(crate) trait MailSource: Send {
    /// Connect, select, and fetch the unseen messages. A connect or
    /// authentication error here is fatal for the run.
    async fn fetch_unseen(&mut self) -> Result<FetchBatch>;

    /// Apply per-message flags and release the session. Called once after
    /// the notify stage, whatever its outcome.
    async fn finish(&mut self, dispositions: Vec<(u32, Disposition)>) -> Result<()>;
}

pub(crate) struct ImapSource {
    config: ImapConfig,
    mailbox: Option<Mailbox>,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            mailbox: None,
        }
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn fetch_unseen(&mut self) -> Result<FetchBatch> {
        let config = self.config.clone();
        let (mailbox, messages) =
            tokio::task::spawn_blocking(move || -> Result<(Mailbox, Vec<MailMessage>)> {
                let mut mailbox = Mailbox::connect(&config)?;
                let messages = mailbox.fetch_unseen()?;
                Ok((mailbox, messages))
            })
            .await
            .context("Mailbox task panicked")??;

        let batch = FetchBatch {
            mailbox: mailbox.name().to_string(),
            uid_validity: mailbox.uid_validity(),
            messages,
        };
        // Session kept for the flag pass in finish().
        self.mailbox = Some(mailbox);
        Ok(batch)
    }

    async fn finish(&mut self, dispositions: Vec<(u32, Disposition)>) -> Result<()> {
        let Some(mailbox) = self.mailbox.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            let mut mailbox = mailbox;
            let applied = mailbox.apply(&dispositions);
            let logged_out = mailbox.logout();
            applied.and(logged_out)
        })
        .await
        .context("Mailbox task panicked")?
    }
}

/// One full watcher invocation: connect, fetch unseen, filter, notify,
/// record, apply server flags, log out. Fresh state every call; the only
/// cross-run memory is the seen-state store.
pub async fn run(config: &Config, notifier: &dyn Notifier, store: &SeenStore) -> Result<RunReport> {
    let mut source = ImapSource::new(config.imap.clone());
    run_with_source(&mut source, config, notifier, store).await
}

pub(crate) async fn run_with_source(
    source: &mut dyn MailSource,
    config: &Config,
    notifier: &dyn Notifier,
    store: &SeenStore,
) -> Result<RunReport> {
    let batch = source.fetch_unseen().await?;
    info!(
        "Fetched {} unseen message(s) from {}",
        batch.messages.len(),
        batch.mailbox
    );

    let matcher = TermMatcher::new(&config.matching.search_terms);
    let http = if config.matching.follow_links {
        Some(
            reqwest::Client::builder()
                .timeout(LINK_TIMEOUT)
                .user_agent(LINK_USER_AGENT)
                .build()
                .context("Failed to build HTTP client")?,
        )
    } else {
        None
    };

    let (report, dispositions) = process_messages(
        &batch.messages,
        &batch.mailbox,
        batch.uid_validity,
        &config.matching,
        &matcher,
        notifier,
        store,
        http.as_ref(),
    )
    .await?;

    // Flag failures only warn: the seen-state store already prevents
    // duplicate notification on the next run.
    if let Err(e) = source.finish(dispositions).await {
        warn!("Failed to update mailbox flags: {:#}", e);
    }

    let pruned = store.prune_older_than(config.seen.retention_days).await?;
    if pruned > 0 {
        debug!("Pruned {} old seen-state row(s)", pruned);
    }

    info!(
        "Run done: {} fetched, {} skipped, {} matched, {} notified, {} failed",
        report.fetched, report.skipped, report.matched, report.notified, report.failed
    );
    Ok(report)
}

/// The filtering/notifying stage, separated from IMAP I/O so it can be
/// exercised against an in-memory store and a fake notifier.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn process_messages(
    messages: &[MailMessage],
    mailbox_name: &str,
    uid_validity: u32,
    matching: &MatchingConfig,
    matcher: &TermMatcher,
    notifier: &dyn Notifier,
    store: &SeenStore,
    http: Option<&reqwest::Client>,
) -> Result<(RunReport, Vec<(u32, Disposition)>)> {
    let mut report = RunReport {
        fetched: messages.len(),
        ..RunReport::default()
    };
    let mut dispositions = Vec::with_capacity(messages.len());

    for msg in messages {
        let id = SeenStore::make_id(mailbox_name, uid_validity, msg.uid);

        if store.is_notified(&id).await? {
            debug!("Skipping already-notified message {}", id);
            report.skipped += 1;
            dispositions.push((msg.uid, Disposition::MarkSeen));
            continue;
        }

        let mut matched = matcher.matches(&msg.search_space());
        if matched.is_empty() {
            if let Some(client) = http {
                matched = probe_links(client, &msg.links(), matcher).await;
            }
        }

        if matched.is_empty() {
            let disposition = if matching.delete_unmatched {
                Disposition::Delete
            } else {
                Disposition::MarkSeen
            };
            debug!("No match for uid {} ({:?})", msg.uid, disposition);
            dispositions.push((msg.uid, disposition));
            continue;
        }

        report.matched += 1;
        let alert = format_alert(msg, &matched);
        match notifier.send(&alert).await {
            Ok(()) => {
                store
                    .record(&NotifiedMessage {
                        id,
                        message_id: msg.message_id.clone(),
                        subject: msg.subject.clone(),
                        matched_terms: matched.join(","),
                    })
                    .await?;
                report.notified += 1;
                dispositions.push((msg.uid, Disposition::MarkSeen));
            }
            Err(e) => {
                // Isolate-and-continue: one failed notification must not
                // abort the rest of the run.
                error!("Failed to notify for message uid {}: {:#}", msg.uid, e);
                report.failed += 1;
                dispositions.push((msg.uid, Disposition::Keep));
            }
        }
    }

    Ok((report, dispositions))
}

/// Fetch up to `MAX_LINK_PROBES` body links and scan each page for the
/// search terms, stopping at the first page that matches. Probe failures
/// are expected (dead links, slow hosts) and only logged.
async fn probe_links(
    client: &reqwest::Client,
    links: &[String],
    matcher: &TermMatcher,
) -> Vec<String> {
    for url in links.iter().take(MAX_LINK_PROBES) {
        let response = match client.get(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(r) => r,
            Err(e) => {
                debug!("Link probe failed for {}: {}", url, e);
                continue;
            }
        };
        let body = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                debug!("Link probe body failed for {}: {}", url, e);
                continue;
            }
        };
        let matched = matcher.matches(&body);
        if !matched.is_empty() {
            debug!("Link probe hit at {}", url);
            return matched;
        }
    }
    Vec::new()
}

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;
use std::sync::OnceLock;

/// A fetched mailbox message, reduced to the fields the watcher needs.
/// Transient; lives only for the duration of one run.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// IMAP UID within the selected mailbox.
    pub uid: u32,
    pub message_id: Option<String>,
    pub from: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    /// Concatenated text/plain parts plus tag-stripped text/html parts.
    pub body: String,
}

impl MailMessage {
    /// Subject and body joined, the text terms are matched against.
    pub fn search_space(&self) -> String {
        format!("{}\n{}", self.subject, self.body)
    }

    /// http(s) links found in the body, in order of appearance, deduplicated.
    pub fn links(&self) -> Vec<String> {
        extract_links(&self.body)
    }

    /// First body link, for the notification summary.
    pub fn first_link(&self) -> Option<String> {
        self.links().into_iter().next()
    }
}

/// Parse a raw RFC822 message into a `MailMessage`. Encoded-word headers
/// (RFC 2047) are decoded by mailparse.
pub fn parse_message(uid: u32, raw: &[u8]) -> Result<MailMessage> {
    let mail = mailparse::parse_mail(raw)
        .with_context(|| format!("Failed to parse MIME for message uid {uid}"))?;

    let subject = mail.headers.get_first_value("Subject").unwrap_or_default();
    let from = mail.headers.get_first_value("From").unwrap_or_default();
    let message_id = mail.headers.get_first_value("Message-ID");
    let date = mail
        .headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Ok(MailMessage {
        uid,
        message_id,
        from,
        subject,
        date,
        body: extract_text(&mail),
    })
}

fn extract_text(mail: &ParsedMail) -> String {
    let mut parts = Vec::new();
    collect_text(mail, &mut parts);
    parts.join("\n")
}

fn collect_text(part: &ParsedMail, out: &mut Vec<String>) {
    if part.subparts.is_empty() {
        match part.ctype.mimetype.as_str() {
            "text/plain" => {
                if let Ok(body) = part.get_body() {
                    out.push(body);
                }
            }
            "text/html" => {
                if let Ok(body) = part.get_body() {
                    out.push(strip_html(&body));
                }
            }
            _ => {}
        }
    } else {
        for sub in &part.subparts {
            collect_text(sub, out);
        }
    }
}

/// Reduce an HTML body to searchable text: drop script/style blocks,
/// remove tags, decode the common entities, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    static BLOCKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();

    let blocks = BLOCKS.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap()
    });
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap());
    let space = SPACE.get_or_init(|| Regex::new(r"\s+").unwrap());

    let text = blocks.replace_all(html, " ");
    let text = tags.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    space.replace_all(&text, " ").trim().to_string()
}

/// Extract http(s) links from free text, preserving order, deduplicated.
pub fn extract_links(text: &str) -> Vec<String> {
    static LINK: OnceLock<Regex> = OnceLock::new();
    let link = LINK.get_or_init(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap());

    let mut seen = std::collections::HashSet::new();
    link.find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

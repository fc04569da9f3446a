pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::MailMessage;

/// Telegram rejects messages longer than 4096 chars; stay under it so a
/// multi-chunk alert never trips the limit mid-chunk.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Delivery seam for matched-message alerts. One implementation per
/// messaging platform.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Human-readable alert for a matched message: matched terms, subject,
/// sender, and the first body link if any.
pub fn format_alert(msg: &MailMessage, matched: &[String]) -> String {
    let subject = if msg.subject.is_empty() {
        "(no subject)"
    } else {
        msg.subject.as_str()
    };
    let link = msg.first_link().unwrap_or_else(|| "(no link)".to_string());
    format!(
        "Mailbox hit (found: {})\n{}\nFrom: {}\n{}",
        matched.join(", "),
        subject,
        msg.from,
        link
    )
}

/// Break an over-long alert into chunks of at most [`MAX_MESSAGE_LEN`]
/// bytes, preferring to cut at a newline or space. Cuts land on UTF-8
/// character boundaries, never inside a multi-byte sequence.
pub fn split_message(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let cut = rest[..cut]
            .rfind('\n')
            .or_else(|| rest[..cut].rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(cut);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    chunks.push(rest.to_string());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> MailMessage {
        MailMessage {
            uid: 7,
            message_id: Some("<m7@example.com>".to_string()),
            from: "Facebook <notification@facebookmail.com>".to_string(),
            subject: "Moma available now".to_string(),
            date: None,
            body: "Details: https://www.facebook.com/n/?x=1".to_string(),
        }
    }

    #[test]
    fn alert_names_terms_subject_sender_and_link() {
        let text = format_alert(&sample_message(), &["Moma".to_string()]);
        assert!(text.contains("found: Moma"));
        assert!(text.contains("Moma available now"));
        assert!(text.contains("notification@facebookmail.com"));
        assert!(text.contains("https://www.facebook.com/n/?x=1"));
    }

    #[test]
    fn alert_handles_missing_subject_and_link() {
        let mut msg = sample_message();
        msg.subject = String::new();
        msg.body = "no links here".to_string();
        let text = format_alert(&msg, &["Moma".to_string()]);
        assert!(text.contains("(no subject)"));
        assert!(text.contains("(no link)"));
    }

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hello"), vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_without_losing_text() {
        let text = "word ".repeat(2000);
        let chunks = split_message(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= MAX_MESSAGE_LEN));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn split_respects_utf8_boundaries() {
        // Two-byte characters with no spaces to cut at.
        let text = "מ".repeat(3000);
        let chunks = split_message(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= MAX_MESSAGE_LEN));
        assert_eq!(chunks.concat(), text);
    }
}

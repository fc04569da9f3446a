use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::debug;

use super::{split_message, Notifier};
use crate::config::TelegramConfig;

/// Sends alerts to a single Telegram chat.
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(config.bot_token.clone()),
            chat_id: ChatId(config.chat_id),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        for chunk in split_message(text) {
            self.bot
                .send_message(self.chat_id, chunk)
                .await
                .context("Failed to send Telegram message")?;
        }
        debug!("Telegram alert delivered to chat {}", self.chat_id);
        Ok(())
    }
}

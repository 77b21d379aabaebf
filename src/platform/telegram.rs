use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::Destination;
use crate::config::TelegramConfig;

/// Telegram rejects messages longer than this
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParseMode {
    #[default]
    Markdown,
    MarkdownV2,
    #[serde(rename = "HTML")]
    Html,
}

impl FromStr for ParseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" => Ok(ParseMode::Markdown),
            "markdownv2" => Ok(ParseMode::MarkdownV2),
            "html" => Ok(ParseMode::Html),
            other => Err(format!("unknown parse mode: {}", other)),
        }
    }
}

/// Body of a `sendMessage` call
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: ParseMode,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("send request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Telegram answered {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Sends rendered notifications to one Telegram chat via the Bot API
pub struct TelegramClient {
    client: reqwest::Client,
    /// Contains the bot token; never log it
    endpoint: String,
    chat_id: String,
    parse_mode: ParseMode,
    dry_run: bool,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.send_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            chat_id: config.chat_id.clone(),
            parse_mode: config.parse_mode,
            dry_run: config.dry_run,
        })
    }

    /// One `sendMessage` call. Only HTTP 200 counts as success.
    pub async fn send_message(&self, text: &str) -> Result<(), DeliveryError> {
        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text,
            parse_mode: self.parse_mode,
        };

        debug!("Sending request to Telegram chat {}", self.chat_id);
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.without_url()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl Destination for TelegramClient {
    async fn deliver(&self, text: &str) {
        if text.trim().is_empty() {
            warn!("Rendered message is empty, nothing sent to Telegram");
            return;
        }

        if self.dry_run {
            info!("Dry run, message for chat {}:\n{}", self.chat_id, text);
            return;
        }

        let chunks = split_message(text, MAX_MESSAGE_LEN);
        let parts = chunks.len();
        info!("Sending message to Telegram chat {} ({} part(s))", self.chat_id, parts);

        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.send_message(chunk).await {
                error!(part = i + 1, parts, "Send request to Telegram failed: {}", e);
            }
        }
    }
}

//! Telegram channel: long-polls the Bot API for updates.
//!
//! Native Rust Telegram Bot API implementation. Private chats only: the
//! sender's numeric id doubles as the chat id, so the same key routes
//! replies and out-of-band notifications.

use std::time::Duration;

use async_trait::async_trait;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;
use crate::notify::Notifier;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Pause before polling again after a failed `getUpdates`.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Usernames or numeric ids admitted to the bot; `*` admits everyone.
#[derive(Debug, Clone, Default)]
struct Allowlist(Vec<String>);

impl Allowlist {
    fn admits(&self, username: Option<&str>, user_id: Option<&str>) -> bool {
        self.0.iter().any(|entry| {
            entry == "*" || Some(entry.as_str()) == username || Some(entry.as_str()) == user_id
        })
    }
}

/// Telegram channel: connects to the Bot API via long-polling.
#[derive(Clone)]
pub struct TelegramChannel {
    bot_token: String,
    allowlist: Allowlist,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowlist: Allowlist(allowed_users),
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the channel at a different Bot API host.
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);

        for chunk in &chunks {
            self.send_message_chunk(chat_id, chunk).await?;
        }
        Ok(())
    }

    async fn post_send(&self, body: &serde_json::Value) -> Result<reqwest::Response, ChannelError> {
        self.client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_resp = self
            .post_send(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown"
            }))
            .await?;

        let markdown_status = markdown_resp.status();
        if markdown_status.is_success() {
            return Ok(());
        }
        let markdown_err = markdown_resp.text().await.unwrap_or_default();
        if markdown_status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(rate_limited(&markdown_err));
        }

        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_resp = self
            .post_send(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .await?;

        let plain_status = plain_resp.status();
        if plain_status.is_success() {
            return Ok(());
        }
        let plain_err = plain_resp.text().await.unwrap_or_default();
        if plain_status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(rate_limited(&plain_err));
        }

        Err(ChannelError::SendFailed {
            name: "telegram".into(),
            reason: format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            ),
        })
    }
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let allowlist = self.allowlist.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let results = match updates(&data) {
                    Ok(results) => results,
                    Err(reason) => {
                        tracing::warn!("Telegram getUpdates rejected: {reason}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64)
                    {
                        offset = uid + 1;
                    }

                    let Some(incoming) = parse_update(update, &allowlist) else {
                        continue;
                    };

                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        // Private chats share the sender's id.
        let chat_id = msg
            .metadata
            .get("chat_id")
            .and_then(|v| v.as_str())
            .unwrap_or(msg.user_id.as_str());

        self.send_message(chat_id, &response.content).await
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        self.send_message(recipient, text).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Turn one `getUpdates` entry into an `IncomingMessage`, dropping
/// non-text updates and senders outside the allowlist.
/// The update list from a `getUpdates` reply, or why the API refused.
fn updates(data: &serde_json::Value) -> Result<&[serde_json::Value], String> {
    if data.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
        let code = data.get("error_code").and_then(serde_json::Value::as_i64);
        let description = data
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("no description");
        return Err(match code {
            Some(code) => format!("{code} {description}"),
            None => description.to_string(),
        });
    }
    data.get("result")
        .and_then(serde_json::Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| "missing result".to_string())
}

fn parse_update(update: &serde_json::Value, allowlist: &Allowlist) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(serde_json::Value::as_str)?;

    let from = message.get("from");
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(|u| u.as_str());
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string());

    if !allowlist.admits(username, user_id.as_deref()) {
        tracing::warn!(
            username = username.unwrap_or("unknown"),
            user_id = user_id.as_deref().unwrap_or("unknown"),
            "Telegram: ignoring message from unauthorized user"
        );
        return None;
    }

    // Sessions and wallets are keyed by the stable numeric id.
    let Some(user_id) = user_id else {
        tracing::warn!("Telegram: update without sender id, ignoring");
        return None;
    };

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_else(|| user_id.clone());

    let mut incoming = IncomingMessage::new("telegram", &user_id, text).with_metadata(
        serde_json::json!({
            "chat_id": chat_id,
            "username": username,
        }),
    );
    if let Some(name) = username {
        incoming = incoming.with_user_name(name);
    }
    Some(incoming)
}

/// Build a rate-limit error from a 429 body's `parameters.retry_after`.
fn rate_limited(body: &str) -> ChannelError {
    let retry_after = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("parameters")?.get("retry_after")?.as_u64())
        .map(Duration::from_secs);
    tracing::warn!(?retry_after, "Telegram rate limit hit");
    ChannelError::RateLimited {
        name: "telegram".into(),
        retry_after,
    }
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Back off to a char boundary before looking for a split point.
        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { cut } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

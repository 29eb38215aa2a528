//! Channel trait and message types.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// A message received from a user on some channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Name of the channel it arrived on.
    pub channel: String,
    /// Stable platform identity; the conversation session key.
    pub user_id: String,
    /// Display handle, when the platform provides one.
    pub user_name: Option<String>,
    pub content: String,
    /// Channel-specific routing data (e.g. Telegram `chat_id`).
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(channel: &str, user_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            user_id: user_id.to_string(),
            user_name: None,
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_user_name(mut self, name: &str) -> Self {
        self.user_name = Some(name.to_string());
        self
    }
}

/// A reply to an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResponse {
    pub content: String,
}

impl OutgoingResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Stream of inbound messages from one or more channels.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A bidirectional messaging surface.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Begin receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Reply to a message that arrived on this channel.
    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let msg = IncomingMessage::new("telegram", "42", "/start")
            .with_user_name("ana")
            .with_metadata(serde_json::json!({"chat_id": "42"}));
        assert_eq!(msg.user_name.as_deref(), Some("ana"));
        assert_eq!(msg.metadata["chat_id"], "42");
        assert_eq!(msg.content, "/start");
    }

    #[test]
    fn fresh_message_has_null_metadata() {
        let msg = IncomingMessage::new("cli", "local-user", "hi");
        assert!(msg.metadata.is_null());
        assert!(msg.user_name.is_none());
    }
}

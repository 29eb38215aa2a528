//! Channel manager: merges inbound streams and routes replies.

use futures::stream::select_all;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;

/// Owns every registered channel.
#[derive(Default)]
pub struct ChannelManager {
    channels: Vec<Box<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Box<dyn Channel>) {
        tracing::info!(channel = channel.name(), "Registered channel");
        self.channels.push(channel);
    }

    pub fn names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Start every channel and merge their streams into one.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let mut streams = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            streams.push(channel.start().await?);
        }
        Ok(Box::pin(select_all(streams)))
    }

    /// Reply on the channel the message came from.
    pub async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .iter()
            .find(|c| c.name() == msg.channel)
            .ok_or_else(|| ChannelError::UnknownChannel(msg.channel.clone()))?;
        channel.respond(msg, response).await
    }

    pub async fn shutdown_all(&self) -> Result<(), ChannelError> {
        for channel in &self.channels {
            if let Err(e) = channel.shutdown().await {
                tracing::warn!(channel = channel.name(), "Channel shutdown failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;

    struct ScriptedChannel {
        name: &'static str,
        inbound: Vec<&'static str>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedChannel {
        fn new(name: &'static str, inbound: Vec<&'static str>) -> Self {
            Self {
                name,
                inbound,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            let msgs: Vec<_> = self
                .inbound
                .iter()
                .map(|text| IncomingMessage::new(self.name, "u1", text))
                .collect();
            Ok(Box::pin(futures::stream::iter(msgs)))
        }

        async fn respond(
            &self,
            _msg: &IncomingMessage,
            response: OutgoingResponse,
        ) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(response.content);
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn merges_streams_from_all_channels() {
        let mut manager = ChannelManager::new();
        manager.add(Box::new(ScriptedChannel::new("a", vec!["1", "2"])));
        manager.add(Box::new(ScriptedChannel::new("b", vec!["3"])));

        let stream = manager.start_all().await.unwrap();
        let mut contents: Vec<String> = stream.map(|m| m.content).collect().await;
        contents.sort();
        assert_eq!(contents, vec!["1", "2", "3"]);
        assert_eq!(manager.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn respond_to_unknown_channel_fails() {
        let manager = ChannelManager::new();
        let msg = IncomingMessage::new("nowhere", "u1", "hi");
        let err = manager
            .respond(&msg, OutgoingResponse::text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownChannel(_)));
    }
}

//! Terminal channel for running the bot locally without Telegram.
//!
//! Everything typed on stdin comes from a single user, `local-user`.
//! `/quit` ends the stream, which stops the service.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;
use crate::notify::Notifier;

/// Session key used for the single local user.
pub const CLI_USER: &str = "local-user";

const PROMPT: &str = "you> ";

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Blank,
    Quit,
    Message(String),
}

fn classify(raw: &str) -> Line {
    match raw.trim() {
        "" => Line::Blank,
        "/quit" | "/exit" => Line::Quit,
        text => Line::Message(text.to_string()),
    }
}

fn format_notification(recipient: &str, text: &str) -> String {
    if recipient == CLI_USER {
        format!("🔔 {text}")
    } else {
        format!("🔔 [for {recipient}] {text}")
    }
}

/// Reads stdin line by line and prints replies to stdout.
#[derive(Debug, Clone, Default)]
pub struct CliChannel {
    user_name: Option<String>,
}

impl CliChannel {
    /// Uses `$USER` as the display name when it is set.
    pub fn new() -> Self {
        Self {
            user_name: std::env::var("USER").ok(),
        }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let user_name = self.user_name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            eprint!("{PROMPT}");

            loop {
                let raw = match lines.next_line().await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading stdin: {e}");
                        break;
                    }
                };
                let text = match classify(&raw) {
                    Line::Blank => {
                        eprint!("{PROMPT}");
                        continue;
                    }
                    Line::Quit => break,
                    Line::Message(text) => text,
                };

                let mut msg = IncomingMessage::new("cli", CLI_USER, &text);
                if let Some(name) = &user_name {
                    msg = msg.with_user_name(name);
                }
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        _msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        println!("\nbot> {}\n", response.content);
        eprint!("{PROMPT}");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[async_trait]
impl Notifier for CliChannel {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n{}\n", format_notification(recipient, text));
        eprint!("{PROMPT}");
        Ok(())
    }
}

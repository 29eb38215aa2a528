//! Out-of-band user notifications.

pub mod retrier;

pub use retrier::{DeliveryOutcome, NotificationRetrier};

use async_trait::async_trait;

use crate::error::ChannelError;

/// Something that can push a text message to a user outside a reply.
///
/// Implementations report rate limiting as `ChannelError::RateLimited`;
/// every other error is treated as permanent.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError>;
}

//! Detached, bounded-retry notification delivery.

use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::Notifier;
use crate::config::RetryPolicy;
use crate::error::ChannelError;

/// How a single notification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Still rate limited after the last allowed attempt.
    GaveUp { attempts: u32 },
    /// A non-rate-limit failure; never retried.
    Failed { attempts: u32 },
}

/// Wraps a `Notifier` with exponential backoff on rate limiting.
///
/// `notify` returns immediately; delivery runs on a detached task that
/// outlives the caller and is aborted by `shutdown`.
pub struct NotificationRetrier {
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    tasks: Mutex<JoinSet<DeliveryOutcome>>,
}

impl NotificationRetrier {
    pub fn new(notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self {
            notifier,
            policy,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Schedule delivery of `message` to `recipient`. Must be called from
    /// within a tokio runtime.
    pub fn notify(&self, recipient: &str, message: &str) {
        let notifier = Arc::clone(&self.notifier);
        let policy = self.policy;
        let recipient = recipient.to_string();
        let message = message.to_string();

        let Ok(mut tasks) = self.tasks.lock() else {
            warn!(recipient = %recipient, "Notification task set poisoned, dropping message");
            return;
        };
        // Reap finished deliveries so the set does not grow unbounded.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { deliver(notifier.as_ref(), policy, &recipient, &message).await });
    }

    /// Number of deliveries still running.
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait for every scheduled delivery to finish.
    pub async fn drain(&self) -> Vec<DeliveryOutcome> {
        let mut tasks = self.take_tasks();
        let mut outcomes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok(outcome) = result {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Abandon every delivery still in flight.
    pub async fn shutdown(&self) {
        let mut tasks = self.take_tasks();
        if !tasks.is_empty() {
            info!(pending = tasks.len(), "Cancelling pending notifications");
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    fn take_tasks(&self) -> JoinSet<DeliveryOutcome> {
        match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Attempt delivery up to `policy.max_attempts` times, sleeping between
/// rate-limited attempts.
pub async fn deliver(
    notifier: &dyn Notifier,
    policy: RetryPolicy,
    recipient: &str,
    message: &str,
) -> DeliveryOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match notifier.send(recipient, message).await {
            Ok(()) => {
                debug!(recipient, attempt, "Notification delivered");
                return DeliveryOutcome::Delivered { attempts: attempt };
            }
            Err(ChannelError::RateLimited { retry_after, .. }) if attempt < max_attempts => {
                let wait = policy
                    .backoff_after(attempt)
                    .max(retry_after.unwrap_or_default());
                warn!(recipient, attempt, ?wait, "Notification rate limited, backing off");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) if e.is_rate_limited() => {
                warn!(recipient, attempt, "Notification still rate limited, giving up");
                return DeliveryOutcome::GaveUp { attempts: attempt };
            }
            Err(e) => {
                warn!(recipient, attempt, error = %e, "Notification failed, not retrying");
                return DeliveryOutcome::Failed { attempts: attempt };
            }
        }
    }
}

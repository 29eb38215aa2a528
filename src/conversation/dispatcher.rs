//! Per-user message serialization.
//!
//! Each user gets a worker task fed by an unbounded queue, so one user's
//! messages are handled strictly in order while different users proceed in
//! parallel. A worker exits after sitting idle for `idle_timeout`, and the
//! handler is told to expire that user's session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::channels::{ChannelManager, IncomingMessage, OutgoingResponse};
use crate::conversation::engine::ConversationEngine;

/// Handles one message to completion.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, msg: IncomingMessage);

    /// Called once a user's worker has gone idle and deregistered.
    fn expire(&self, _user_key: &str) {}
}

/// Runs the message through the engine and replies on its channel.
pub struct EngineResponder {
    engine: Arc<ConversationEngine>,
    channels: Arc<ChannelManager>,
}

impl EngineResponder {
    pub fn new(engine: Arc<ConversationEngine>, channels: Arc<ChannelManager>) -> Self {
        Self { engine, channels }
    }
}

#[async_trait]
impl SessionHandler for EngineResponder {
    async fn handle(&self, msg: IncomingMessage) {
        let reply = self.engine.handle(&msg).await;
        if let Err(e) = self
            .channels
            .respond(&msg, OutgoingResponse::text(reply))
            .await
        {
            tracing::error!(user = %msg.user_id, channel = %msg.channel, "Failed to send reply: {e}");
        }
    }

    fn expire(&self, user_key: &str) {
        self.engine.expire(user_key);
    }
}

type Workers = Arc<Mutex<HashMap<String, UnboundedSender<IncomingMessage>>>>;

pub struct SessionDispatcher {
    handler: Arc<dyn SessionHandler>,
    idle_timeout: Duration,
    workers: Workers,
}

impl SessionDispatcher {
    pub fn new(handler: Arc<dyn SessionHandler>, idle_timeout: Duration) -> Self {
        Self {
            handler,
            idle_timeout,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue `msg` behind any earlier messages from the same user.
    pub fn dispatch(&self, msg: IncomingMessage) {
        let Ok(mut workers) = self.workers.lock() else {
            tracing::error!(user = %msg.user_id, "Worker map poisoned, dropping message");
            return;
        };

        let msg = match workers.get(&msg.user_id) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return,
                // The worker died without deregistering; start a new one.
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };

        let user_key = msg.user_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(msg).is_err() {
            return;
        }
        workers.insert(user_key.clone(), tx);
        tracing::debug!(user = %user_key, "Started session worker");

        tokio::spawn(run_worker(
            user_key,
            rx,
            Arc::clone(&self.handler),
            Arc::clone(&self.workers),
            self.idle_timeout,
        ));
    }

    pub fn active_workers(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Stop accepting work. Workers finish their queued messages and exit.
    pub fn shutdown(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.clear();
        }
    }
}

async fn run_worker(
    user_key: String,
    mut rx: UnboundedReceiver<IncomingMessage>,
    handler: Arc<dyn SessionHandler>,
    workers: Workers,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(msg)) => handler.handle(msg).await,
            Ok(None) => break,
            Err(_) => {
                // Deregister and expire under the lock so `dispatch` cannot
                // queue a message we would never read, and a new worker cannot
                // start a session before this one is dropped.
                let next = {
                    let Ok(mut map) = workers.lock() else { break };
                    match rx.try_recv() {
                        Ok(msg) => Some(msg),
                        Err(_) => {
                            map.remove(&user_key);
                            handler.expire(&user_key);
                            None
                        }
                    }
                };
                match next {
                    Some(msg) => handler.handle(msg).await,
                    None => break,
                }
            }
        }
    }
    tracing::debug!(user = %user_key, "Session worker exited");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        delay: Duration,
        seen: Mutex<Vec<(String, String)>>,
        expired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn handle(&self, msg: IncomingMessage) {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push((msg.user_id, msg.content));
        }

        fn expire(&self, user_key: &str) {
            self.expired.lock().unwrap().push(user_key.to_string());
        }
    }

    impl Recorder {
        async fn wait_for(&self, n: usize) -> Vec<(String, String)> {
            for _ in 0..200 {
                let seen = self.seen.lock().unwrap().clone();
                if seen.len() >= n {
                    return seen;
                }
                drop(seen);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("handler saw fewer than {n} messages");
        }
    }

    #[tokio::test]
    async fn messages_from_one_user_are_handled_in_order() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let dispatcher = SessionDispatcher::new(recorder.clone(), Duration::from_secs(5));

        for i in 0..5 {
            dispatcher.dispatch(IncomingMessage::new("cli", "u1", &i.to_string()));
        }

        let seen = recorder.wait_for(5).await;
        let contents: Vec<&str> = seen.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(contents, vec!["0", "1", "2", "3", "4"]);
        assert_eq!(dispatcher.active_workers(), 1);
    }

    #[tokio::test]
    async fn different_users_run_in_parallel() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let dispatcher = SessionDispatcher::new(recorder.clone(), Duration::from_secs(5));

        let started = Instant::now();
        dispatcher.dispatch(IncomingMessage::new("cli", "u1", "a"));
        dispatcher.dispatch(IncomingMessage::new("cli", "u2", "b"));
        recorder.wait_for(2).await;

        assert!(started.elapsed() < Duration::from_millis(380));
        assert_eq!(dispatcher.active_workers(), 2);
    }

    #[tokio::test]
    async fn idle_worker_exits_and_is_restarted_on_demand() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = SessionDispatcher::new(recorder.clone(), Duration::from_millis(20));

        dispatcher.dispatch(IncomingMessage::new("cli", "u1", "first"));
        recorder.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dispatcher.active_workers(), 0);
        assert_eq!(*recorder.expired.lock().unwrap(), vec!["u1".to_string()]);

        dispatcher.dispatch(IncomingMessage::new("cli", "u1", "second"));
        let seen = recorder.wait_for(2).await;
        assert_eq!(seen[1].1, "second");
    }

    #[tokio::test]
    async fn shutdown_lets_queued_messages_finish() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(10),
            ..Default::default()
        });
        let dispatcher = SessionDispatcher::new(recorder.clone(), Duration::from_secs(5));

        dispatcher.dispatch(IncomingMessage::new("cli", "u1", "a"));
        dispatcher.dispatch(IncomingMessage::new("cli", "u1", "b"));
        dispatcher.shutdown();

        assert_eq!(recorder.wait_for(2).await.len(), 2);
        assert_eq!(dispatcher.active_workers(), 0);
        assert!(recorder.expired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_worker_does_not_expire() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = SessionDispatcher::new(recorder.clone(), Duration::from_millis(50));

        for i in 0..5 {
            dispatcher.dispatch(IncomingMessage::new("cli", "u1", &i.to_string()));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        recorder.wait_for(5).await;
        assert!(recorder.expired.lock().unwrap().is_empty());
    }
}

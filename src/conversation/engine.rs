//! Conversation Engine: runs the state machine and executes its effects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::channels::IncomingMessage;
use crate::conversation::prompts;
use crate::conversation::state::{Context, Effect, Input, SessionState, transition};
use crate::error::{DatabaseError, RewardError};
use crate::kyc::model::{ProfileUpsert, User};
use crate::ledger::LedgerClient;
use crate::quiz::model::Quiz;
use crate::quiz::reward::{RewardWorkflow, Settlement};
use crate::store::Database;

/// Owns every in-flight session. Sessions live in memory only; a restart
/// drops dialogues in progress.
///
/// Callers must not run two messages for the same user concurrently;
/// `SessionDispatcher` guarantees that.
pub struct ConversationEngine {
    db: Arc<dyn Database>,
    ledger: Arc<dyn LedgerClient>,
    rewards: Arc<RewardWorkflow>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl ConversationEngine {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: Arc<dyn LedgerClient>,
        rewards: Arc<RewardWorkflow>,
    ) -> Self {
        Self {
            db,
            ledger,
            rewards,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Current state for `user_key`; `Idle` when no session exists.
    pub fn session_state(&self, user_key: &str) -> SessionState {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(user_key).cloned())
            .unwrap_or_default()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn commit(&self, user_key: &str, next: SessionState) {
        let Ok(mut sessions) = self.sessions.lock() else {
            error!(user = %user_key, "Session map poisoned");
            return;
        };
        if next.is_idle() {
            sessions.remove(user_key);
        } else {
            sessions.insert(user_key.to_string(), next);
        }
    }

    /// Process one inbound message and return the reply text.
    pub async fn handle(&self, msg: &IncomingMessage) -> String {
        let user_key = msg.user_id.as_str();
        let input = Input::parse(&msg.content);
        let state = self.session_state(user_key);

        let (user, quiz, quiz_passed) = match self.lookup(user_key, &input, &state).await {
            Ok(found) => found,
            Err(e) => {
                error!(user = %user_key, "Session lookup failed: {e}");
                return prompts::TRY_AGAIN_LATER.to_string();
            }
        };

        // A pass whose transfer never happened is paid instead of re-offered.
        if quiz_passed && state.is_idle() && user.as_ref().is_some_and(User::is_approved) {
            if let Some(quiz) = &quiz {
                if let Some(reply) = self.retry_unpaid(user_key, quiz).await {
                    return reply;
                }
            }
        }

        let ctx = Context {
            today: Utc::now().date_naive(),
            user: user.as_ref(),
            quiz: quiz.as_ref(),
            quiz_passed,
        };
        let t = transition(&state, input, &ctx);
        debug!(user = %user_key, from = %state, to = %t.next, "Session transition");

        match t.effect {
            Effect::Reply(text) => {
                self.commit(user_key, t.next);
                text
            }
            Effect::SubmitProfile(profile) => {
                match self
                    .db
                    .upsert_profile(user_key, msg.user_name.as_deref(), &profile)
                    .await
                {
                    Ok(outcome) => {
                        self.commit(user_key, t.next);
                        match outcome {
                            ProfileUpsert::Created(_) => {
                                info!(user = %user_key, "Identity submitted for review");
                                prompts::SUBMITTED.to_string()
                            }
                            ProfileUpsert::Resubmitted(_) => {
                                info!(user = %user_key, "Identity resubmitted for review");
                                prompts::RESUBMITTED.to_string()
                            }
                            ProfileUpsert::AlreadyApproved(_) => {
                                prompts::ALREADY_VERIFIED.to_string()
                            }
                        }
                    }
                    Err(e) => {
                        // Keep the session so the user can resend the last field.
                        error!(user = %user_key, "Failed to save profile: {e}");
                        prompts::TRY_AGAIN_LATER.to_string()
                    }
                }
            }
            Effect::ListQuizzes => {
                self.commit(user_key, t.next);
                match self.db.list_quizzes().await {
                    Ok(quizzes) => prompts::quiz_list(&quizzes),
                    Err(e) => {
                        error!("Failed to list quizzes: {e}");
                        prompts::TRY_AGAIN_LATER.to_string()
                    }
                }
            }
            Effect::ShowWallet => {
                self.commit(user_key, t.next);
                self.wallet(user.as_ref()).await
            }
            Effect::Settle { quiz_id, score } => {
                self.commit(user_key, t.next);
                match quiz {
                    Some(quiz) => self.settle(user_key, &quiz, score).await,
                    None => {
                        warn!(user = %user_key, quiz_id, "Quiz vanished before settlement");
                        prompts::QUIZ_NOT_FOUND.to_string()
                    }
                }
            }
        }
    }

    /// Fetch what the transition needs to know about this user and quiz.
    async fn lookup(
        &self,
        user_key: &str,
        input: &Input,
        state: &SessionState,
    ) -> Result<(Option<User>, Option<Quiz>, bool), DatabaseError> {
        let user = self.db.get_user(user_key).await?;

        let quiz_id = match input {
            Input::PickQuiz(id) if state.is_idle() => Some(*id),
            _ => state.quiz_id(),
        };
        let quiz = match quiz_id {
            Some(id) => self.db.get_quiz(id).await?,
            None => None,
        };

        let quiz_passed = match (input, &quiz) {
            (Input::PickQuiz(_), Some(quiz)) => self.db.has_passed(user_key, quiz.id).await?,
            _ => false,
        };

        Ok((user, quiz, quiz_passed))
    }

    async fn wallet(&self, user: Option<&User>) -> String {
        let Some(account) = user.and_then(|u| u.account.as_ref()) else {
            return prompts::NOT_VERIFIED.to_string();
        };
        match self.ledger.get_balance(&account.signing_key).await {
            Ok(balance) => prompts::wallet(&account.address, Some(balance)),
            Err(e) => {
                warn!(address = %account.address, "Balance lookup failed: {e}");
                prompts::wallet(&account.address, None)
            }
        }
    }

    async fn settle(&self, user_key: &str, quiz: &Quiz, score: u32) -> String {
        let result = self.rewards.settle(user_key, quiz.id, score).await;
        self.settlement_reply(user_key, quiz, result)
    }

    async fn retry_unpaid(&self, user_key: &str, quiz: &Quiz) -> Option<String> {
        let result = self.rewards.retry_unpaid(user_key, quiz.id).await.transpose()?;
        Some(self.settlement_reply(user_key, quiz, result))
    }

    fn settlement_reply(
        &self,
        user_key: &str,
        quiz: &Quiz,
        result: Result<Settlement, RewardError>,
    ) -> String {
        match result {
            Ok(Settlement::NotPassed { completion }) => prompts::not_passed(quiz, &completion),
            Ok(Settlement::Rewarded { completion }) => prompts::rewarded(quiz, &completion),
            Ok(Settlement::AlreadyRewarded {
                completion,
                original,
            }) => prompts::already_rewarded(quiz, &completion, &original),
            Err(RewardError::Transfer(e)) => {
                error!(user = %user_key, quiz_id = quiz.id, "Reward transfer failed: {e}");
                prompts::reward_failed(quiz, e.is_definitely_not_applied())
            }
            Err(e) => {
                error!(user = %user_key, quiz_id = quiz.id, "Settlement failed: {e}");
                prompts::TRY_AGAIN_LATER.to_string()
            }
        }
    }

    /// Drop the session for `user_key`, abandoning any dialogue in progress.
    pub fn expire(&self, user_key: &str) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        if sessions.remove(user_key).is_some() {
            debug!(user = %user_key, "Expired idle session");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use secrecy::SecretString;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::kyc::approval::ApprovalCoordinator;
    use crate::kyc::model::VerificationStatus;
    use crate::ledger::{AccountKeys, MemoryKeyStore};
    use crate::notify::NotificationRetrier;
    use crate::quiz::model::{CredentialTemplate, Question};
    use crate::store::LibSqlBackend;
    use crate::testing::{FakeLedger, RecordingNotifier, indeterminate, unavailable};

    struct Harness {
        db: Arc<dyn Database>,
        ledger: Arc<FakeLedger>,
        approvals: ApprovalCoordinator,
        engine: ConversationEngine,
    }

    async fn harness() -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_quiz(&Quiz {
            id: 1,
            name: "Solar Panel Cleaning".into(),
            questions: vec![
                Question {
                    prompt: "Best time to clean?".into(),
                    options: vec!["Noon".into(), "Early morning".into()],
                    correct_index: 1,
                },
                Question {
                    prompt: "Use a pressure washer?".into(),
                    options: vec!["Yes".into(), "No".into()],
                    correct_index: 1,
                },
                Question {
                    prompt: "Switch the system off first?".into(),
                    options: vec!["Yes".into(), "No".into()],
                    correct_index: 0,
                },
            ],
            pass_threshold: 3,
            reward_amount: dec!(0.02),
            credential_template: Some(CredentialTemplate {
                name: "{quiz} Expert".into(),
                description: "Scored {score}/{total}".into(),
                image_url: "https://example.com/badge.png".into(),
                attributes: serde_json::json!({}),
            }),
        })
        .await
        .unwrap();

        let ledger = Arc::new(FakeLedger::new());
        let custody = Arc::new(MemoryKeyStore::new(Some(AccountKeys {
            address: "0xcustody".into(),
            signing_key: SecretString::from("custody".to_string()),
        })));
        let retrier = Arc::new(NotificationRetrier::new(
            Arc::new(RecordingNotifier::default()),
            RetryPolicy::default(),
        ));
        let rewards = Arc::new(RewardWorkflow::new(
            Arc::clone(&db),
            ledger.clone(),
            custody,
            Arc::clone(&retrier),
        ));
        let approvals = ApprovalCoordinator::new(
            Arc::clone(&db),
            ledger.clone(),
            retrier,
            Duration::from_secs(300),
        );
        let engine = ConversationEngine::new(Arc::clone(&db), ledger.clone(), rewards);
        Harness {
            db,
            ledger,
            approvals,
            engine,
        }
    }

    async fn say(engine: &ConversationEngine, text: &str) -> String {
        let msg = IncomingMessage::new("telegram", "42", text).with_user_name("ana");
        engine.handle(&msg).await
    }

    async fn register(engine: &ConversationEngine) {
        for text in ["/start", "Ana", "1990-01-01", "555-0100", "a@example.com"] {
            say(engine, text).await;
        }
    }

    #[tokio::test]
    async fn kyc_creates_pending_user() {
        let h = harness().await;
        assert!(say(&h.engine, "/start").await.contains("full name"));
        say(&h.engine, "Ana").await;
        say(&h.engine, "1990-01-01").await;
        say(&h.engine, "555-0100").await;
        let reply = say(&h.engine, "a@example.com").await;

        assert_eq!(reply, prompts::SUBMITTED);
        assert_eq!(h.engine.active_sessions(), 0);
        let user = h.db.get_user("42").await.unwrap().unwrap();
        assert_eq!(user.status, VerificationStatus::Pending);
        assert_eq!(user.username.as_deref(), Some("ana"));
        assert!(user.account.is_none());
    }

    #[tokio::test]
    async fn cancel_discards_scratch_without_persisting() {
        let h = harness().await;
        say(&h.engine, "/start").await;
        say(&h.engine, "Ana").await;
        assert_eq!(say(&h.engine, "cancel").await, prompts::CANCELLED);
        assert!(h.engine.session_state("42").is_idle());
        assert!(h.db.get_user("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_user_can_resubmit() {
        let h = harness().await;
        register(&h.engine).await;
        say(&h.engine, "/start").await;
        say(&h.engine, "Ana Maria").await;
        say(&h.engine, "1990-01-01").await;
        say(&h.engine, "555-0100").await;
        assert_eq!(say(&h.engine, "a@example.com").await, prompts::RESUBMITTED);
        let user = h.db.get_user("42").await.unwrap().unwrap();
        assert_eq!(user.profile.full_name, "Ana Maria");
    }

    #[tokio::test]
    async fn pending_user_cannot_take_quiz() {
        let h = harness().await;
        register(&h.engine).await;
        assert_eq!(say(&h.engine, "/quiz 1").await, prompts::NOT_VERIFIED);
        assert_eq!(say(&h.engine, "/wallet").await, prompts::NOT_VERIFIED);
    }

    #[tokio::test]
    async fn approved_user_passes_quiz_once() {
        let h = harness().await;
        register(&h.engine).await;
        h.approvals.approve("42").await.unwrap();

        assert_eq!(say(&h.engine, "/start").await, prompts::ALREADY_VERIFIED);
        assert!(say(&h.engine, "/quiz").await.contains("/quiz 1"));
        assert!(say(&h.engine, "/quiz 1").await.contains("Solar Panel Cleaning"));
        assert!(say(&h.engine, "yes").await.starts_with("Question 1/3"));
        say(&h.engine, "2").await;
        say(&h.engine, "no").await;
        let result = say(&h.engine, "1").await;

        assert!(result.contains("You passed"), "{result}");
        assert!(result.contains("badge has been minted"), "{result}");
        assert_eq!(h.ledger.transfer_count(), 1);
        assert_eq!(h.ledger.mint_count(), 1);

        let again = say(&h.engine, "/quiz 1").await;
        assert!(again.contains("already completed"), "{again}");
        assert_eq!(h.ledger.transfer_count(), 1);
    }

    #[tokio::test]
    async fn failing_attempt_can_be_retried() {
        let h = harness().await;
        register(&h.engine).await;
        h.approvals.approve("42").await.unwrap();

        say(&h.engine, "/quiz 1").await;
        say(&h.engine, "yes").await;
        say(&h.engine, "1").await;
        say(&h.engine, "2").await;
        let result = say(&h.engine, "2").await;

        assert!(result.contains("You scored 1/3"), "{result}");
        assert_eq!(h.ledger.transfer_count(), 0);
        assert!(say(&h.engine, "/quiz 1").await.contains("reply *yes*"));
    }

    async fn pass_quiz(engine: &ConversationEngine) -> String {
        say(engine, "/quiz 1").await;
        say(engine, "yes").await;
        say(engine, "2").await;
        say(engine, "2").await;
        say(engine, "1").await
    }

    #[tokio::test]
    async fn failed_transfer_is_paid_when_the_quiz_is_picked_again() {
        let h = harness().await;
        register(&h.engine).await;
        h.approvals.approve("42").await.unwrap();
        h.ledger.fail_next_transfer(unavailable("transfer"));

        let result = pass_quiz(&h.engine).await;
        assert!(result.contains("could not be sent"), "{result}");
        assert!(result.contains("/quiz 1"), "{result}");
        assert_eq!(h.ledger.transfer_count(), 0);

        let retry = say(&h.engine, "/quiz 1").await;
        assert!(retry.contains("You passed"), "{retry}");
        assert!(retry.contains("Transaction:"), "{retry}");
        assert_eq!(h.ledger.transfer_count(), 1);
        assert!(h.engine.session_state("42").is_idle());

        let completions = h.db.list_completions("42").await.unwrap();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].reward_tx.is_some());

        let again = say(&h.engine, "/quiz 1").await;
        assert!(again.contains("already completed"), "{again}");
        assert_eq!(h.ledger.transfer_count(), 1);
    }

    #[tokio::test]
    async fn unknown_transfer_outcome_is_reported_as_under_review() {
        let h = harness().await;
        register(&h.engine).await;
        h.approvals.approve("42").await.unwrap();
        h.ledger.fail_next_transfer(indeterminate("transfer"));

        let result = pass_quiz(&h.engine).await;
        assert!(result.contains("under review"), "{result}");

        let retry = say(&h.engine, "/quiz 1").await;
        assert!(retry.contains("under review"), "{retry}");
        assert!(!retry.contains("already rewarded"), "{retry}");
        assert_eq!(h.ledger.transfer_count(), 0);
    }

    #[tokio::test]
    async fn expire_drops_a_dialogue_in_progress() {
        let h = harness().await;
        say(&h.engine, "/start").await;
        say(&h.engine, "Ana").await;
        assert_eq!(h.engine.active_sessions(), 1);

        h.engine.expire("42");
        assert_eq!(h.engine.active_sessions(), 0);
        assert!(h.engine.session_state("42").is_idle());
        assert!(h.db.get_user("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wallet_shows_address_and_balance() {
        let h = harness().await;
        register(&h.engine).await;
        h.approvals.approve("42").await.unwrap();
        *h.ledger.balance.lock().unwrap() = dec!(0.02);

        let reply = say(&h.engine, "/wallet").await;
        assert!(reply.contains("0xacct0"), "{reply}");
        assert!(reply.contains("0.02"), "{reply}");
    }
}

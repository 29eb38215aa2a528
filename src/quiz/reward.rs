//! Reward Workflow: records an attempt, pays a pass once, mints a credential.
//!
//! Ordering: the completion record is written first, then the reward claim
//! is taken, then value is transferred and its reference stored, and only
//! then is a credential minted. Transfer is the guarantee; the credential is
//! best effort and is never retried here.
//!
//! A pass whose transfer certainly did not happen keeps its completion but
//! loses its claim. `retry_unpaid` picks such a pass up again.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{LedgerError, RewardError};
use crate::ledger::{CustodialKeyStore, LedgerClient};
use crate::notify::NotificationRetrier;
use crate::quiz::model::{CredentialRef, Quiz, QuizCompletion};
use crate::store::{Database, RewardClaim};

/// What `settle` did with an attempt.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Below the pass threshold; only the attempt was recorded.
    NotPassed { completion: QuizCompletion },
    /// Reward transferred. `completion.credential` is `None` when minting
    /// failed or no template is configured.
    Rewarded { completion: QuizCompletion },
    /// Another passing attempt already owns the reward. Its `reward_tx` is
    /// `None` while that transfer's outcome is unknown.
    AlreadyRewarded {
        completion: QuizCompletion,
        original: QuizCompletion,
    },
}

impl Settlement {
    pub fn completion(&self) -> &QuizCompletion {
        match self {
            Self::NotPassed { completion }
            | Self::Rewarded { completion }
            | Self::AlreadyRewarded { completion, .. } => completion,
        }
    }
}

pub struct RewardWorkflow {
    db: Arc<dyn Database>,
    ledger: Arc<dyn LedgerClient>,
    custody: Arc<dyn CustodialKeyStore>,
    notifications: Arc<NotificationRetrier>,
}

impl RewardWorkflow {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: Arc<dyn LedgerClient>,
        custody: Arc<dyn CustodialKeyStore>,
        notifications: Arc<NotificationRetrier>,
    ) -> Self {
        Self {
            db,
            ledger,
            custody,
            notifications,
        }
    }

    /// Record an attempt at `quiz_id` scoring `score` and pay out on a pass.
    pub async fn settle(
        &self,
        user_key: &str,
        quiz_id: i64,
        score: u32,
    ) -> Result<Settlement, RewardError> {
        let (quiz, address) = self.load(user_key, quiz_id).await?;

        let completion = QuizCompletion::new(user_key, &quiz, score.min(quiz.total()));
        self.db.insert_completion(&completion).await?;

        if !completion.passed {
            info!(
                user = %user_key,
                quiz_id,
                score = completion.score,
                total = completion.total,
                "Quiz attempt recorded, not passed"
            );
            return Ok(Settlement::NotPassed { completion });
        }

        let Some(address) = address else {
            return Err(RewardError::NoAccount(user_key.to_string()));
        };
        self.pay(&quiz, completion, &address).await
    }

    /// Pay a recorded pass of `quiz_id` that has no reward yet.
    ///
    /// Returns `None` when nothing is owed: no passing attempt exists, or a
    /// transfer for this quiz already went through. A claim whose transfer
    /// outcome is unknown comes back as `AlreadyRewarded` with no `reward_tx`.
    pub async fn retry_unpaid(
        &self,
        user_key: &str,
        quiz_id: i64,
    ) -> Result<Option<Settlement>, RewardError> {
        let attempts: Vec<QuizCompletion> = self
            .db
            .list_completions(user_key)
            .await?
            .into_iter()
            .filter(|c| c.quiz_id == quiz_id)
            .collect();

        if let Some(owner) = attempts.iter().find(|c| c.reward_claimed) {
            if owner.reward_tx.is_some() {
                return Ok(None);
            }
            return Ok(Some(Settlement::AlreadyRewarded {
                completion: owner.clone(),
                original: owner.clone(),
            }));
        }

        let Some(unpaid) = attempts.into_iter().rev().find(|c| c.passed) else {
            return Ok(None);
        };

        let (quiz, address) = self.load(user_key, quiz_id).await?;
        let Some(address) = address else {
            return Err(RewardError::NoAccount(user_key.to_string()));
        };
        info!(user = %user_key, quiz_id, completion = %unpaid.id, "Retrying unpaid quiz reward");
        self.pay(&quiz, unpaid, &address).await.map(Some)
    }

    async fn load(
        &self,
        user_key: &str,
        quiz_id: i64,
    ) -> Result<(Quiz, Option<String>), RewardError> {
        let quiz = self
            .db
            .get_quiz(quiz_id)
            .await?
            .ok_or(RewardError::QuizNotFound(quiz_id))?;
        let user = self
            .db
            .get_user(user_key)
            .await?
            .ok_or_else(|| RewardError::UserNotFound(user_key.to_string()))?;
        Ok((quiz, user.account_address().map(str::to_string)))
    }

    /// Claim, transfer, record, then mint for a passing `completion`.
    async fn pay(
        &self,
        quiz: &Quiz,
        mut completion: QuizCompletion,
        address: &str,
    ) -> Result<Settlement, RewardError> {
        match self.db.claim_reward(completion.id).await? {
            RewardClaim::Claimed => completion.reward_claimed = true,
            RewardClaim::AlreadyClaimed(original) => {
                info!(
                    user = %completion.user_key,
                    quiz_id = quiz.id,
                    original = %original.id,
                    "Reward already claimed for this quiz"
                );
                return Ok(Settlement::AlreadyRewarded {
                    completion,
                    original,
                });
            }
        }

        let tx = self.transfer(quiz, &completion, address).await?;
        completion.reward_tx = Some(tx);

        if let Some(template) = &quiz.credential_template {
            let metadata = template.render(quiz, &completion);
            match self.ledger.mint_credential(address, &metadata).await {
                Ok(receipt) => match self.db.record_credential(completion.id, &receipt).await {
                    Ok(()) => {
                        completion.credential = Some(CredentialRef {
                            token_id: receipt.token_id,
                            transaction_ref: receipt.transaction_ref,
                        });
                    }
                    Err(e) => {
                        error!(
                            completion = %completion.id,
                            token_id = %receipt.token_id,
                            "Credential minted but not recorded: {e}"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        completion = %completion.id,
                        "Credential mint failed, left pending: {e}"
                    );
                }
            }
        }

        self.notifications
            .notify(&completion.user_key, &reward_message(quiz, &completion));
        Ok(Settlement::Rewarded { completion })
    }

    /// Pay the reward for a claimed completion and store the transaction.
    async fn transfer(
        &self,
        quiz: &Quiz,
        completion: &QuizCompletion,
        to: &str,
    ) -> Result<String, RewardError> {
        let custody = match self.custody.load().await? {
            Some(keys) => keys,
            None => {
                self.release(completion).await;
                return Err(RewardError::Transfer(LedgerError::NoCustodialAccount));
            }
        };

        let tx = match self
            .ledger
            .transfer(&custody.signing_key, to, quiz.reward_amount)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                if e.is_definitely_not_applied() {
                    self.release(completion).await;
                } else {
                    error!(
                        completion = %completion.id,
                        "Reward transfer outcome unknown, claim kept for review: {e}"
                    );
                }
                return Err(RewardError::Transfer(e));
            }
        };

        if let Err(e) = self.db.record_reward(completion.id, &tx).await {
            // The claim stays set, so no retry can pay twice.
            error!(completion = %completion.id, tx = %tx, "Reward paid but not recorded: {e}");
            return Err(e.into());
        }

        info!(
            user = %completion.user_key,
            quiz_id = quiz.id,
            amount = %quiz.reward_amount,
            tx = %tx,
            "Quiz reward paid"
        );
        Ok(tx)
    }

    async fn release(&self, completion: &QuizCompletion) {
        if let Err(e) = self.db.release_reward(completion.id).await {
            warn!(completion = %completion.id, "Failed to release reward claim: {e}");
        }
    }
}

fn reward_message(quiz: &Quiz, completion: &QuizCompletion) -> String {
    let mut text = format!(
        "Your reward of {} for *{}* has been paid.",
        quiz.reward_amount, quiz.name
    );
    if let Some(tx) = &completion.reward_tx {
        text.push_str(&format!("\nTransaction: {tx}"));
    }
    if let Some(credential) = &completion.credential {
        text.push_str(&format!("\nBadge token: #{}", credential.token_id));
    }
    text
}

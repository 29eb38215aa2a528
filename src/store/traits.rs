//! `Database` trait: single async interface for all persistence.
//!
//! Every check-then-act sequence the workflows rely on (provisioning,
//! reward claims) is a single guarded statement here, so correctness does
//! not depend on in-process locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::kyc::model::{Profile, ProfileUpsert, User, VerificationStatus};
use crate::ledger::{AccountKeys, MintReceipt};
use crate::quiz::model::{Quiz, QuizCompletion};

/// Result of trying to take the provisioning claim for a user.
#[derive(Debug, Clone)]
pub enum ProvisionClaim {
    /// This caller owns provisioning and must complete or release it.
    Claimed,
    /// The user already has an account.
    AlreadyProvisioned(User),
    /// Another caller holds a fresh claim.
    InProgress,
}

/// Result of trying to take the reward claim for a passing completion.
#[derive(Debug, Clone)]
pub enum RewardClaim {
    Claimed,
    /// A completion for the same (user, quiz) pair, possibly this one,
    /// already owns the reward.
    AlreadyClaimed(QuizCompletion),
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// Create or overwrite a pending user's profile. Approved users are
    /// left untouched.
    async fn upsert_profile(
        &self,
        user_key: &str,
        username: Option<&str>,
        profile: &Profile,
    ) -> Result<ProfileUpsert, DatabaseError>;

    async fn get_user(&self, user_key: &str) -> Result<Option<User>, DatabaseError>;

    /// List users, optionally filtered by status, oldest first.
    async fn list_users(
        &self,
        status: Option<VerificationStatus>,
    ) -> Result<Vec<User>, DatabaseError>;

    /// Take the provisioning claim unless the user already has an account
    /// or a claim newer than `stale_before` exists.
    async fn claim_provisioning(
        &self,
        user_key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<ProvisionClaim, DatabaseError>;

    /// Store the account and approve the user in one update. Returns
    /// `false` if the user already had an account.
    async fn complete_provisioning(
        &self,
        user_key: &str,
        account: &AccountKeys,
    ) -> Result<bool, DatabaseError>;

    /// Drop a provisioning claim after account creation failed.
    async fn release_provisioning(&self, user_key: &str) -> Result<(), DatabaseError>;

    // ── Quizzes ─────────────────────────────────────────────────────

    async fn upsert_quiz(&self, quiz: &Quiz) -> Result<(), DatabaseError>;

    async fn get_quiz(&self, id: i64) -> Result<Option<Quiz>, DatabaseError>;

    async fn list_quizzes(&self) -> Result<Vec<Quiz>, DatabaseError>;

    // ── Completions ─────────────────────────────────────────────────

    async fn insert_completion(&self, completion: &QuizCompletion) -> Result<(), DatabaseError>;

    async fn get_completion(&self, id: Uuid) -> Result<Option<QuizCompletion>, DatabaseError>;

    /// Mark `completion_id` as the reward owner for its (user, quiz) pair
    /// unless another completion already is.
    async fn claim_reward(&self, completion_id: Uuid) -> Result<RewardClaim, DatabaseError>;

    async fn record_reward(&self, completion_id: Uuid, tx_ref: &str) -> Result<(), DatabaseError>;

    /// Give up a reward claim whose transfer certainly did not happen.
    async fn release_reward(&self, completion_id: Uuid) -> Result<(), DatabaseError>;

    async fn record_credential(
        &self,
        completion_id: Uuid,
        receipt: &MintReceipt,
    ) -> Result<(), DatabaseError>;

    /// The completion that owns the reward for (user, quiz), if any.
    async fn find_rewarded_completion(
        &self,
        user_key: &str,
        quiz_id: i64,
    ) -> Result<Option<QuizCompletion>, DatabaseError>;

    /// Whether any attempt for (user, quiz) passed.
    async fn has_passed(&self, user_key: &str, quiz_id: i64) -> Result<bool, DatabaseError>;

    async fn list_completions(&self, user_key: &str) -> Result<Vec<QuizCompletion>, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}

//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::kyc::model::{Profile, ProfileUpsert, User, VerificationStatus};
use crate::ledger::{AccountKeys, MintReceipt};
use crate::quiz::model::{CredentialRef, Quiz, QuizCompletion};
use crate::store::migrations;
use crate::store::traits::{Database, ProvisionClaim, RewardClaim};

const USER_COLUMNS: &str = "user_key, username, status, full_name, birthdate, phone, email, \
     wallet_address, signing_key, created_at, updated_at";

const QUIZ_COLUMNS: &str =
    "id, name, questions, pass_threshold, reward_amount, credential_template";

const COMPLETION_COLUMNS: &str = "id, user_key, quiz_id, score, total, passed, reward_claimed, \
     reward_tx, credential_token_id, credential_tx, completed_at";

/// How many times a contended reward claim is re-evaluated.
const CLAIM_ATTEMPTS: usize = 3;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_one<T>(
        &self,
        ctx: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
        map: impl FnOnce(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{ctx} row: {e}"))),
        }
    }

    async fn query_all<T>(
        &self,
        ctx: &str,
        sql: &str,
        args: impl libsql::params::IntoParams,
        map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;
        let mut out = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => out.push(map(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{ctx} row: {e}"))),
            }
        }
        Ok(out)
    }

    async fn try_claim_reward(&self, completion: &QuizCompletion) -> Result<bool, DatabaseError> {
        let result = self
            .conn()
            .execute(
                "UPDATE quiz_completions SET reward_claimed = 1, updated_at = ?1
                 WHERE id = ?2 AND passed = 1 AND reward_claimed = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM quiz_completions
                       WHERE user_key = ?3 AND quiz_id = ?4 AND reward_claimed = 1
                   )",
                params![
                    now_str(),
                    completion.id.to_string(),
                    completion.user_key.as_str(),
                    completion.quiz_id
                ],
            )
            .await;

        match result {
            Ok(n) => Ok(n == 1),
            // The partial unique index caught a concurrent claim.
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("claim_reward: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn text(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {name}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {name}: {e}")))
}

fn row_to_user(row: &libsql::Row) -> Result<User, DatabaseError> {
    let status_str: String = text(row, 2, "status")?;
    let status: VerificationStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    let birthdate_str: String = text(row, 4, "birthdate")?;
    let birthdate = NaiveDate::parse_from_str(&birthdate_str, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("birthdate {birthdate_str:?}: {e}")))?;

    let wallet: Option<String> = row.get::<String>(7).ok();
    let signing_key: Option<String> = row.get::<String>(8).ok();
    let account = match (wallet, signing_key) {
        (Some(address), Some(key)) => Some(AccountKeys {
            address,
            signing_key: SecretString::from(key),
        }),
        _ => None,
    };

    let created: String = text(row, 9, "created_at")?;
    let updated: String = text(row, 10, "updated_at")?;

    Ok(User {
        user_key: text(row, 0, "user_key")?,
        username: row.get::<String>(1).ok(),
        status,
        profile: Profile {
            full_name: text(row, 3, "full_name")?,
            birthdate,
            phone: text(row, 5, "phone")?,
            email: text(row, 6, "email")?,
        },
        account,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_quiz(row: &libsql::Row) -> Result<Quiz, DatabaseError> {
    let questions_json: String = text(row, 2, "questions")?;
    let questions = serde_json::from_str(&questions_json)
        .map_err(|e| DatabaseError::Serialization(format!("quiz.questions: {e}")))?;

    let amount_str: String = text(row, 4, "reward_amount")?;
    let reward_amount = amount_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("quiz.reward_amount: {e}")))?;

    let credential_template = match row.get::<String>(5).ok() {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Serialization(format!("quiz.template: {e}")))?,
        ),
        None => None,
    };

    let pass_threshold: i64 = int(row, 3, "pass_threshold")?;

    Ok(Quiz {
        id: int(row, 0, "id")?,
        name: text(row, 1, "name")?,
        questions,
        pass_threshold: pass_threshold as u32,
        reward_amount,
        credential_template,
    })
}

fn row_to_completion(row: &libsql::Row) -> Result<QuizCompletion, DatabaseError> {
    let id_str: String = text(row, 0, "id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("completion.id: {e}")))?;

    let score: i64 = int(row, 3, "score")?;
    let total: i64 = int(row, 4, "total")?;
    let passed: i64 = int(row, 5, "passed")?;
    let claimed: i64 = int(row, 6, "reward_claimed")?;

    let credential = match (row.get::<String>(8).ok(), row.get::<String>(9).ok()) {
        (Some(token_id), Some(transaction_ref)) => Some(CredentialRef {
            token_id,
            transaction_ref,
        }),
        _ => None,
    };

    let completed: String = text(row, 10, "completed_at")?;

    Ok(QuizCompletion {
        id,
        user_key: text(row, 1, "user_key")?,
        quiz_id: int(row, 2, "quiz_id")?,
        score: score as u32,
        total: total as u32,
        passed: passed != 0,
        reward_claimed: claimed != 0,
        reward_tx: row.get::<String>(7).ok(),
        credential,
        completed_at: parse_datetime(&completed),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.query_one("ping", "SELECT 1", (), |_| Ok(()))
            .await
            .map(|_| ())
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn upsert_profile(
        &self,
        user_key: &str,
        username: Option<&str>,
        profile: &Profile,
    ) -> Result<ProfileUpsert, DatabaseError> {
        let existing = self.get_user(user_key).await?;
        if let Some(user) = existing.as_ref()
            && user.account.is_some()
        {
            return Ok(ProfileUpsert::AlreadyApproved(user.clone()));
        }

        let now = now_str();
        // The conflict guard keeps a concurrently provisioned user approved.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO users
                    (user_key, username, status, full_name, birthdate, phone, email, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(user_key) DO UPDATE SET
                    username = excluded.username,
                    status = 'pending',
                    full_name = excluded.full_name,
                    birthdate = excluded.birthdate,
                    phone = excluded.phone,
                    email = excluded.email,
                    updated_at = excluded.updated_at
                 WHERE users.wallet_address IS NULL",
                params![
                    user_key,
                    opt_text(username),
                    profile.full_name.as_str(),
                    profile.birthdate.format("%Y-%m-%d").to_string(),
                    profile.phone.as_str(),
                    profile.email.as_str(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_profile: {e}")))?;

        let user = self
            .get_user(user_key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "user".into(),
                id: user_key.into(),
            })?;

        debug!(user = %user_key, changed, "Profile upserted");
        Ok(match (changed, existing) {
            (0, _) => ProfileUpsert::AlreadyApproved(user),
            (_, Some(_)) => ProfileUpsert::Resubmitted(user),
            (_, None) => ProfileUpsert::Created(user),
        })
    }

    async fn get_user(&self, user_key: &str) -> Result<Option<User>, DatabaseError> {
        self.query_one(
            "get_user",
            &format!("SELECT {USER_COLUMNS} FROM users WHERE user_key = ?1"),
            params![user_key],
            row_to_user,
        )
        .await
    }

    async fn list_users(
        &self,
        status: Option<VerificationStatus>,
    ) -> Result<Vec<User>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_all(
                    "list_users",
                    &format!(
                        "SELECT {USER_COLUMNS} FROM users WHERE status = ?1 ORDER BY created_at ASC"
                    ),
                    params![status.as_str()],
                    row_to_user,
                )
                .await
            }
            None => {
                self.query_all(
                    "list_users",
                    &format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC"),
                    (),
                    row_to_user,
                )
                .await
            }
        }
    }

    async fn claim_provisioning(
        &self,
        user_key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<ProvisionClaim, DatabaseError> {
        let claimed = self
            .conn()
            .execute(
                "UPDATE users SET provisioning_started_at = ?1
                 WHERE user_key = ?2 AND wallet_address IS NULL
                   AND (provisioning_started_at IS NULL OR provisioning_started_at < ?3)",
                params![
                    Utc::now().timestamp_millis(),
                    user_key,
                    stale_before.timestamp_millis()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_provisioning: {e}")))?;

        if claimed == 1 {
            return Ok(ProvisionClaim::Claimed);
        }

        match self.get_user(user_key).await? {
            Some(user) if user.account.is_some() => Ok(ProvisionClaim::AlreadyProvisioned(user)),
            Some(_) => Ok(ProvisionClaim::InProgress),
            None => Err(DatabaseError::NotFound {
                entity: "user".into(),
                id: user_key.into(),
            }),
        }
    }

    async fn complete_provisioning(
        &self,
        user_key: &str,
        account: &AccountKeys,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE users SET
                    wallet_address = ?1,
                    signing_key = ?2,
                    status = 'approved',
                    provisioning_started_at = NULL,
                    updated_at = ?3
                 WHERE user_key = ?4 AND wallet_address IS NULL",
                params![
                    account.address.as_str(),
                    account.signing_key.expose_secret(),
                    now_str(),
                    user_key
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_provisioning: {e}")))?;
        Ok(changed == 1)
    }

    async fn release_provisioning(&self, user_key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE users SET provisioning_started_at = NULL
                 WHERE user_key = ?1 AND wallet_address IS NULL",
                params![user_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_provisioning: {e}")))?;
        Ok(())
    }

    // ── Quizzes ─────────────────────────────────────────────────────

    async fn upsert_quiz(&self, quiz: &Quiz) -> Result<(), DatabaseError> {
        let questions = serde_json::to_string(&quiz.questions)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let template = quiz
            .credential_template
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO quizzes (id, name, questions, pass_threshold, reward_amount, credential_template)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    questions = excluded.questions,
                    pass_threshold = excluded.pass_threshold,
                    reward_amount = excluded.reward_amount,
                    credential_template = excluded.credential_template",
                params![
                    quiz.id,
                    quiz.name.as_str(),
                    questions,
                    quiz.pass_threshold as i64,
                    quiz.reward_amount.to_string(),
                    opt_text(template.as_deref())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_quiz: {e}")))?;
        Ok(())
    }

    async fn get_quiz(&self, id: i64) -> Result<Option<Quiz>, DatabaseError> {
        self.query_one(
            "get_quiz",
            &format!("SELECT {QUIZ_COLUMNS} FROM quizzes WHERE id = ?1"),
            params![id],
            row_to_quiz,
        )
        .await
    }

    async fn list_quizzes(&self) -> Result<Vec<Quiz>, DatabaseError> {
        self.query_all(
            "list_quizzes",
            &format!("SELECT {QUIZ_COLUMNS} FROM quizzes ORDER BY id ASC"),
            (),
            row_to_quiz,
        )
        .await
    }

    // ── Completions ─────────────────────────────────────────────────

    async fn insert_completion(&self, completion: &QuizCompletion) -> Result<(), DatabaseError> {
        let completed_at = completion.completed_at.to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO quiz_completions
                    (id, user_key, quiz_id, score, total, passed, reward_claimed, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
                params![
                    completion.id.to_string(),
                    completion.user_key.as_str(),
                    completion.quiz_id,
                    completion.score as i64,
                    completion.total as i64,
                    completion.passed as i64,
                    completed_at
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_completion: {e}")))?;
        Ok(())
    }

    async fn get_completion(&self, id: Uuid) -> Result<Option<QuizCompletion>, DatabaseError> {
        self.query_one(
            "get_completion",
            &format!("SELECT {COMPLETION_COLUMNS} FROM quiz_completions WHERE id = ?1"),
            params![id.to_string()],
            row_to_completion,
        )
        .await
    }

    async fn claim_reward(&self, completion_id: Uuid) -> Result<RewardClaim, DatabaseError> {
        let completion =
            self.get_completion(completion_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "quiz_completion".into(),
                    id: completion_id.to_string(),
                })?;

        if !completion.passed {
            return Err(DatabaseError::Constraint(format!(
                "completion {completion_id} did not pass"
            )));
        }
        if completion.reward_claimed {
            // Claimed by an earlier caller; only one caller may transfer.
            return Ok(RewardClaim::AlreadyClaimed(completion));
        }

        for _ in 0..CLAIM_ATTEMPTS {
            if self.try_claim_reward(&completion).await? {
                return Ok(RewardClaim::Claimed);
            }
            if let Some(owner) = self
                .find_rewarded_completion(&completion.user_key, completion.quiz_id)
                .await?
            {
                return Ok(RewardClaim::AlreadyClaimed(owner));
            }
            // The owner released between our two statements; try again.
        }

        warn!(completion = %completion_id, "Reward claim stayed contended");
        Err(DatabaseError::Constraint(format!(
            "reward claim for completion {completion_id} is contended"
        )))
    }

    async fn record_reward(&self, completion_id: Uuid, tx_ref: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE quiz_completions SET reward_tx = ?1, updated_at = ?2
                 WHERE id = ?3 AND reward_claimed = 1",
                params![tx_ref, now_str(), completion_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_reward: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::Constraint(format!(
                "completion {completion_id} does not own a reward claim"
            )));
        }
        Ok(())
    }

    async fn release_reward(&self, completion_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE quiz_completions SET reward_claimed = 0, updated_at = ?1
                 WHERE id = ?2 AND reward_tx IS NULL",
                params![now_str(), completion_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_reward: {e}")))?;
        Ok(())
    }

    async fn record_credential(
        &self,
        completion_id: Uuid,
        receipt: &MintReceipt,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE quiz_completions
                 SET credential_token_id = ?1, credential_tx = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    receipt.token_id.as_str(),
                    receipt.transaction_ref.as_str(),
                    now_str(),
                    completion_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_credential: {e}")))?;
        Ok(())
    }

    async fn find_rewarded_completion(
        &self,
        user_key: &str,
        quiz_id: i64,
    ) -> Result<Option<QuizCompletion>, DatabaseError> {
        self.query_one(
            "find_rewarded_completion",
            &format!(
                "SELECT {COMPLETION_COLUMNS} FROM quiz_completions
                 WHERE user_key = ?1 AND quiz_id = ?2 AND reward_claimed = 1
                 LIMIT 1"
            ),
            params![user_key, quiz_id],
            row_to_completion,
        )
        .await
    }

    async fn has_passed(&self, user_key: &str, quiz_id: i64) -> Result<bool, DatabaseError> {
        let count = self
            .query_one(
                "has_passed",
                "SELECT COUNT(*) FROM quiz_completions
                 WHERE user_key = ?1 AND quiz_id = ?2 AND passed = 1",
                params![user_key, quiz_id],
                |row| int(row, 0, "count"),
            )
            .await?
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn list_completions(&self, user_key: &str) -> Result<Vec<QuizCompletion>, DatabaseError> {
        self.query_all(
            "list_completions",
            &format!(
                "SELECT {COMPLETION_COLUMNS} FROM quiz_completions
                 WHERE user_key = ?1 ORDER BY completed_at ASC"
            ),
            params![user_key],
            row_to_completion,
        )
        .await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        self.query_one(
            "get_setting",
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| text(row, 0, "value"),
        )
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}

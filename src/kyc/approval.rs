//! Approval Coordinator: provisions a ledger account at most once per user.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{ApprovalError, DatabaseError};
use crate::kyc::model::User;
use crate::ledger::LedgerClient;
use crate::notify::NotificationRetrier;
use crate::store::{Database, ProvisionClaim};

/// Outcome of an approval request.
#[derive(Debug, Clone)]
pub enum Approval {
    /// A new account was created and stored by this call.
    Provisioned(User),
    /// The user already had an account; nothing changed.
    AlreadyProvisioned(User),
}

impl Approval {
    pub fn user(&self) -> &User {
        match self {
            Self::Provisioned(u) | Self::AlreadyProvisioned(u) => u,
        }
    }
}

pub struct ApprovalCoordinator {
    db: Arc<dyn Database>,
    ledger: Arc<dyn LedgerClient>,
    notifications: Arc<NotificationRetrier>,
    stale_after: Duration,
}

impl ApprovalCoordinator {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: Arc<dyn LedgerClient>,
        notifications: Arc<NotificationRetrier>,
        stale_after: Duration,
    ) -> Self {
        Self {
            db,
            ledger,
            notifications,
            stale_after,
        }
    }

    /// Approve `user_key`, creating their ledger account unless one exists.
    pub async fn approve(&self, user_key: &str) -> Result<Approval, ApprovalError> {
        let stale_before =
            Utc::now() - chrono::Duration::milliseconds(self.stale_after.as_millis() as i64);

        let claim = match self.db.claim_provisioning(user_key, stale_before).await {
            Ok(claim) => claim,
            Err(DatabaseError::NotFound { .. }) => {
                return Err(ApprovalError::UserNotFound(user_key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match claim {
            ProvisionClaim::Claimed => {}
            ProvisionClaim::AlreadyProvisioned(user) => {
                info!(user = %user_key, "Approval repeated, account already provisioned");
                return Ok(Approval::AlreadyProvisioned(user));
            }
            ProvisionClaim::InProgress => {
                return Err(ApprovalError::InProgress(user_key.to_string()));
            }
        }

        let keys = match self.ledger.create_account().await {
            Ok(keys) => keys,
            Err(e) => {
                if e.is_definitely_not_applied() {
                    if let Err(release_err) = self.db.release_provisioning(user_key).await {
                        warn!(user = %user_key, "Failed to release provisioning claim: {release_err}");
                    }
                } else {
                    // Left to go stale so a retry cannot race a late success.
                    warn!(user = %user_key, "Account creation outcome unknown, keeping claim");
                }
                return Err(e.into());
            }
        };

        match self.db.complete_provisioning(user_key, &keys).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    user = %user_key,
                    leaked = %keys.address,
                    "User was provisioned concurrently; new account discarded"
                );
                let user = self.load_user(user_key).await?;
                return Ok(Approval::AlreadyProvisioned(user));
            }
            Err(e) => {
                error!(
                    user = %user_key,
                    leaked = %keys.address,
                    "Account created but not persisted: {e}"
                );
                return Err(e.into());
            }
        }

        let user = self.load_user(user_key).await?;
        info!(user = %user_key, address = %keys.address, "User approved and provisioned");

        self.notifications
            .notify(user_key, &approval_message(&keys.address));

        Ok(Approval::Provisioned(user))
    }

    async fn load_user(&self, user_key: &str) -> Result<User, ApprovalError> {
        self.db
            .get_user(user_key)
            .await?
            .ok_or_else(|| ApprovalError::UserNotFound(user_key.to_string()))
    }
}

fn approval_message(address: &str) -> String {
    format!(
        "Your identity has been verified!\n\nYour wallet address is: {address}\n\n\
         Send /quiz to see the quizzes you can take to earn rewards."
    )
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::kyc::model::{Profile, VerificationStatus};
    use crate::store::LibSqlBackend;
    use crate::testing::{FakeLedger, RecordingNotifier, indeterminate, unavailable};

    struct Harness {
        db: Arc<dyn Database>,
        ledger: Arc<FakeLedger>,
        notifier: Arc<RecordingNotifier>,
        retrier: Arc<NotificationRetrier>,
        coordinator: ApprovalCoordinator,
    }

    async fn harness() -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = Arc::new(FakeLedger::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let retrier = Arc::new(NotificationRetrier::new(
            notifier.clone(),
            RetryPolicy::default(),
        ));
        let coordinator = ApprovalCoordinator::new(
            Arc::clone(&db),
            ledger.clone(),
            Arc::clone(&retrier),
            Duration::from_secs(300),
        );
        Harness {
            db,
            ledger,
            notifier,
            retrier,
            coordinator,
        }
    }

    async fn register(db: &Arc<dyn Database>, key: &str) {
        let profile = Profile {
            full_name: "Ana".into(),
            birthdate: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            phone: "555-0100".into(),
            email: "a@example.com".into(),
        };
        db.upsert_profile(key, None, &profile).await.unwrap();
    }

    #[tokio::test]
    async fn approve_provisions_and_notifies() {
        let h = harness().await;
        register(&h.db, "42").await;

        let approval = h.coordinator.approve("42").await.unwrap();
        let Approval::Provisioned(user) = approval else {
            panic!("expected Provisioned");
        };
        assert_eq!(user.status, VerificationStatus::Approved);
        assert_eq!(user.account_address(), Some("0xacct0"));

        h.retrier.drain().await;
        let sent = h.notifier.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "42");
        assert!(sent[0].1.contains("0xacct0"));
    }

    #[tokio::test]
    async fn approving_twice_creates_one_account() {
        let h = harness().await;
        register(&h.db, "42").await;

        let first = h.coordinator.approve("42").await.unwrap();
        let second = h.coordinator.approve("42").await.unwrap();

        assert!(matches!(second, Approval::AlreadyProvisioned(_)));
        assert_eq!(first.user().account_address(), second.user().account_address());
        assert_eq!(h.ledger.create_count(), 1);

        h.retrier.drain().await;
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_approvals_create_one_account() {
        let h = harness().await;
        register(&h.db, "42").await;

        let (a, b) = tokio::join!(h.coordinator.approve("42"), h.coordinator.approve("42"));
        let ok: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
        assert!(!ok.is_empty());
        assert_eq!(h.ledger.create_count(), 1);
    }

    #[tokio::test]
    async fn ledger_failure_leaves_user_pending_and_retryable() {
        let h = harness().await;
        register(&h.db, "42").await;
        h.ledger.fail_next_create(unavailable("create_account"));

        let err = h.coordinator.approve("42").await.unwrap_err();
        assert!(matches!(err, ApprovalError::Ledger(_)));

        let user = h.db.get_user("42").await.unwrap().unwrap();
        assert_eq!(user.status, VerificationStatus::Pending);
        assert!(user.account.is_none());

        let retry = h.coordinator.approve("42").await.unwrap();
        assert!(matches!(retry, Approval::Provisioned(_)));
    }

    #[tokio::test]
    async fn indeterminate_failure_blocks_immediate_retry() {
        let h = harness().await;
        register(&h.db, "42").await;
        h.ledger.fail_next_create(indeterminate("create_account"));

        assert!(h.coordinator.approve("42").await.is_err());
        let err = h.coordinator.approve("42").await.unwrap_err();
        assert!(matches!(err, ApprovalError::InProgress(_)));
        assert_eq!(h.ledger.create_count(), 0);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let h = harness().await;
        let err = h.coordinator.approve("nobody").await.unwrap_err();
        assert!(matches!(err, ApprovalError::UserNotFound(_)));
        assert_eq!(h.ledger.create_count(), 0);
    }
}

//! Error types for Learn & Earn.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Reward error: {0}")]
    Reward(#[from] RewardError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid quiz definition {quiz}: {reason}")]
    InvalidQuiz { quiz: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("No channel registered under {0}")]
    UnknownChannel(String),
}

impl ChannelError {
    /// Whether the failure is a rate-limit signal worth retrying.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Ledger service errors.
///
/// `Unavailable` and `Rejected` mean the operation was never applied.
/// `Indeterminate` means the request may have reached the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },

    #[error("Ledger rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("Ledger outcome of {operation} unknown: {reason}")]
    Indeterminate { operation: String, reason: String },

    #[error("Invalid ledger response for {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("No custodial reward account configured")]
    NoCustodialAccount,
}

impl LedgerError {
    /// Whether the ledger certainly did not apply the operation.
    pub fn is_definitely_not_applied(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Rejected { .. } | Self::NoCustodialAccount
        )
    }
}

/// Approval Coordinator errors. All are retryable by the caller except
/// `UserNotFound`.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("Account provisioning already in progress for user {0}")]
    InProgress(String),

    #[error("Account creation failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Persistence failed: {0}")]
    Database(#[from] DatabaseError),
}

/// Reward Workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("User {0} has no ledger account")]
    NoAccount(String),

    #[error("Quiz {0} not found")]
    QuizNotFound(i64),

    #[error("Reward transfer failed: {0}")]
    Transfer(#[source] LedgerError),

    #[error("Persistence failed: {0}")]
    Database(#[from] DatabaseError),
}

/// Input validation failures surfaced back to the user as a re-prompt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("{field} is too long (max {max} characters)")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} is not valid: {hint}")]
    Malformed {
        field: &'static str,
        hint: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_the_only_retryable_channel_error() {
        let limited = ChannelError::RateLimited {
            name: "telegram".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        let failed = ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "chat not found".into(),
        };
        assert!(limited.is_rate_limited());
        assert!(!failed.is_rate_limited());
    }

    #[test]
    fn indeterminate_ledger_errors_are_not_safe_to_release() {
        let unavailable = LedgerError::Unavailable {
            operation: "transfer".into(),
            reason: "connection refused".into(),
        };
        let unknown = LedgerError::Indeterminate {
            operation: "transfer".into(),
            reason: "timed out".into(),
        };
        assert!(unavailable.is_definitely_not_applied());
        assert!(!unknown.is_definitely_not_applied());
    }

    #[test]
    fn errors_convert_into_top_level() {
        let err: Error = DatabaseError::Query("boom".into()).into();
        assert!(err.to_string().contains("boom"));
    }
}

//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read an env var and parse it, falling back to `default` when unset.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Telegram bot settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Usernames or numeric ids; `*` admits everyone.
    pub allowed_users: Vec<String>,
}

impl TelegramConfig {
    /// Returns `None` when `TELEGRAM_BOT_TOKEN` is unset.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let allowed_users = std::env::var("TELEGRAM_ALLOWED_USERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Some(Self {
            bot_token,
            allowed_users,
        })
    }
}

/// Ledger sidecar settings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// Custodial reward account supplied through the environment.
#[derive(Debug, Clone)]
pub struct CustodialSeed {
    pub address: String,
    pub signing_key: SecretString,
}

/// Bounded exponential backoff for notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    /// Wait before the second attempt; doubles after every further failure.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub api_port: u16,
    pub telegram: Option<TelegramConfig>,
    pub ledger: LedgerConfig,
    pub custodial_seed: Option<CustodialSeed>,
    pub quiz_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub notify_retry: RetryPolicy,
    /// Per-user conversation workers exit after this much silence.
    pub session_idle_timeout: Duration,
    /// A provisioning claim older than this is considered abandoned.
    pub provision_stale_after: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("LEARN_EARN_DB_PATH")
            .unwrap_or_else(|_| "./data/learn-earn.db".to_string())
            .into();

        let base_url = std::env::var("LEDGER_SERVICE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("LEDGER_SERVICE_URL".into()))?;

        let custodial_seed = match (
            std::env::var("REWARD_WALLET_ADDRESS"),
            std::env::var("REWARD_WALLET_SIGNING_KEY"),
        ) {
            (Ok(address), Ok(key)) => Some(CustodialSeed {
                address,
                signing_key: SecretString::from(key),
            }),
            (Ok(_), Err(_)) => {
                return Err(ConfigError::MissingEnvVar("REWARD_WALLET_SIGNING_KEY".into()));
            }
            _ => None,
        };

        let notify_retry = RetryPolicy {
            max_attempts: env_parse("NOTIFY_MAX_ATTEMPTS", 3u32)?.max(1),
            initial_backoff: Duration::from_secs(env_parse("NOTIFY_INITIAL_BACKOFF_SECS", 5u64)?),
        };

        Ok(Self {
            db_path,
            api_port: env_parse("LEARN_EARN_API_PORT", 8080u16)?,
            telegram: TelegramConfig::from_env(),
            ledger: LedgerConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                timeout: Duration::from_secs(env_parse("LEDGER_TIMEOUT_SECS", 30u64)?),
            },
            custodial_seed,
            quiz_file: std::env::var("LEARN_EARN_QUIZ_FILE").ok().map(PathBuf::from),
            log_dir: std::env::var("LEARN_EARN_LOG_DIR").ok().map(PathBuf::from),
            notify_retry,
            session_idle_timeout: Duration::from_secs(env_parse(
                "SESSION_IDLE_TIMEOUT_SECS",
                600u64,
            )?),
            provision_stale_after: Duration::from_secs(env_parse(
                "PROVISION_STALE_AFTER_SECS",
                300u64,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_initial() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(20));
    }

    #[test]
    fn default_policy_is_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(5));
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let v: u16 = env_parse("LEARN_EARN_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(v, 42);
    }
}

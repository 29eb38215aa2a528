//! User records and identity-field validation.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ledger::AccountKeys;

const MAX_NAME_LEN: usize = 128;

static PHONE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9 ()\-]+$").expect("static regex"));

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[A-Za-z]{2,}$").expect("static regex")
});

/// Verification (KYC) status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Approved,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            other => Err(format!("unknown verification status: {other}")),
        }
    }
}

/// Identity fields collected during the KYC conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub full_name: String,
    pub birthdate: NaiveDate,
    pub phone: String,
    pub email: String,
}

/// A platform user.
///
/// `account` is set exactly once, together with `status = Approved`.
#[derive(Debug, Clone)]
pub struct User {
    /// Platform user id (Telegram numeric id, or `local-user` on the CLI).
    pub user_key: String,
    pub username: Option<String>,
    pub status: VerificationStatus,
    pub profile: Profile,
    pub account: Option<AccountKeys>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn account_address(&self) -> Option<&str> {
        self.account.as_ref().map(|a| a.address.as_str())
    }

    pub fn is_approved(&self) -> bool {
        self.status == VerificationStatus::Approved && self.account.is_some()
    }
}

/// Outcome of persisting a submitted profile.
#[derive(Debug, Clone)]
pub enum ProfileUpsert {
    /// First submission for this user.
    Created(User),
    /// A pending user resubmitted; profile overwritten, still pending.
    Resubmitted(User),
    /// The user is already approved; nothing was changed.
    AlreadyApproved(User),
}

// ── Field validation ────────────────────────────────────────────────

pub fn validate_name(input: &str) -> Result<String, ValidationError> {
    let name = input.trim();
    if name.is_empty() {
        return Err(ValidationError::Empty { field: "Name" });
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "Name",
            max: MAX_NAME_LEN,
        });
    }
    Ok(name.to_string())
}

/// Parse a `YYYY-MM-DD` birthdate that is not after `today`.
pub fn validate_birthdate(input: &str, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let date = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|_| {
        ValidationError::Malformed {
            field: "Birthdate",
            hint: "use the YYYY-MM-DD format",
        }
    })?;
    if date > today {
        return Err(ValidationError::Malformed {
            field: "Birthdate",
            hint: "it cannot be in the future",
        });
    }
    Ok(date)
}

pub fn validate_phone(input: &str) -> Result<String, ValidationError> {
    let phone = input.trim();
    if phone.is_empty() {
        return Err(ValidationError::Empty { field: "Phone" });
    }
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    if !PHONE_CHARS.is_match(phone) || !(7..=15).contains(&digits) {
        return Err(ValidationError::Malformed {
            field: "Phone",
            hint: "use 7 to 15 digits, optionally with +, spaces or dashes",
        });
    }
    Ok(phone.to_string())
}

pub fn validate_email(input: &str) -> Result<String, ValidationError> {
    let email = input.trim();
    if email.is_empty() {
        return Err(ValidationError::Empty { field: "Email" });
    }
    if !EMAIL.is_match(email) {
        return Err(ValidationError::Malformed {
            field: "Email",
            hint: "expected something like name@example.com",
        });
    }
    Ok(email.to_string())
}

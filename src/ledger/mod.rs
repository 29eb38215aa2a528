//! Ledger integration: custodial accounts and the operations run on them.
//!
//! The ledger itself (key generation, signing, broadcast, the credential
//! contract) lives behind a sidecar service. This module only defines the
//! contract we consume and an HTTP client for it.

pub mod custodial;
pub mod http;

pub use custodial::{
    CustodialKeyStore, MemoryKeyStore, SettingsKeyStore, ensure_custodial_account,
};
pub use http::HttpLedgerClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A freshly provisioned account: public address plus its signing key.
#[derive(Debug, Clone)]
pub struct AccountKeys {
    pub address: String,
    pub signing_key: SecretString,
}

/// Receipt for a minted credential token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub token_id: String,
    pub transaction_ref: String,
}

/// Token metadata handed to the credential contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub attributes: serde_json::Value,
}

/// Opaque ledger service. Offers no deduplication: callers guard every
/// irreversible call with their own idempotency checks.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Generate a new custodial account.
    async fn create_account(&self) -> Result<AccountKeys, LedgerError>;

    /// Transfer `amount` native units from the account behind `signing_key`.
    /// Returns the transaction reference.
    async fn transfer(
        &self,
        signing_key: &SecretString,
        to: &str,
        amount: Decimal,
    ) -> Result<String, LedgerError>;

    /// Mint a proof-of-completion credential to `to`.
    async fn mint_credential(
        &self,
        to: &str,
        metadata: &CredentialMetadata,
    ) -> Result<MintReceipt, LedgerError>;

    /// Balance of the account behind `signing_key`.
    async fn get_balance(&self, signing_key: &SecretString) -> Result<Decimal, LedgerError>;
}

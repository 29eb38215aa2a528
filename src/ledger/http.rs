//! HTTP client for the ledger sidecar.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{AccountKeys, CredentialMetadata, LedgerClient, MintReceipt};
use crate::error::LedgerError;

/// Talks JSON to the ledger sidecar over HTTP.
pub struct HttpLedgerClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    address: String,
    signing_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferResponse {
    transaction_ref: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintResponse {
    token_id: String,
    transaction_ref: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::str")]
    balance: Decimal,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable {
                operation: "client_init".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, LedgerError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_send_error(operation, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let reason = format!("{status}: {detail}");
            tracing::warn!(operation, %status, "Ledger request failed");
            return Err(if status.is_client_error() {
                LedgerError::Rejected {
                    operation: operation.into(),
                    reason,
                }
            } else {
                LedgerError::Indeterminate {
                    operation: operation.into(),
                    reason,
                }
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| LedgerError::InvalidResponse {
                operation: operation.into(),
                reason: e.to_string(),
            })
    }
}

/// A request that never connected was certainly not applied; anything
/// else may have reached the ledger.
fn classify_send_error(operation: &str, e: &reqwest::Error) -> LedgerError {
    if e.is_connect() {
        LedgerError::Unavailable {
            operation: operation.into(),
            reason: e.to_string(),
        }
    } else {
        LedgerError::Indeterminate {
            operation: operation.into(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn create_account(&self) -> Result<AccountKeys, LedgerError> {
        let resp: AccountResponse = self
            .post("create_account", "accounts", serde_json::json!({}))
            .await?;
        Ok(AccountKeys {
            address: resp.address,
            signing_key: SecretString::from(resp.signing_key),
        })
    }

    async fn transfer(
        &self,
        signing_key: &SecretString,
        to: &str,
        amount: Decimal,
    ) -> Result<String, LedgerError> {
        let body = serde_json::json!({
            "signingKey": signing_key.expose_secret(),
            "to": to,
            "amount": amount.to_string(),
        });
        let resp: TransferResponse = self.post("transfer", "transfers", body).await?;
        tracing::info!(to, %amount, tx = %resp.transaction_ref, "Ledger transfer submitted");
        Ok(resp.transaction_ref)
    }

    async fn mint_credential(
        &self,
        to: &str,
        metadata: &CredentialMetadata,
    ) -> Result<MintReceipt, LedgerError> {
        let body = serde_json::json!({
            "to": to,
            "metadata": {
                "name": metadata.name,
                "description": metadata.description,
                "image_url": metadata.image_url,
                "attributes": metadata.attributes,
            },
        });
        let resp: MintResponse = self.post("mint_credential", "credentials", body).await?;
        Ok(MintReceipt {
            token_id: resp.token_id,
            transaction_ref: resp.transaction_ref,
        })
    }

    async fn get_balance(&self, signing_key: &SecretString) -> Result<Decimal, LedgerError> {
        let body = serde_json::json!({ "signingKey": signing_key.expose_secret() });
        let resp: BalanceResponse = self.post("get_balance", "balance", body).await?;
        Ok(resp.balance)
    }
}

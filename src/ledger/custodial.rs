//! Custodial reward account storage.
//!
//! The reward account pays out every quiz reward. Its keys are read from a
//! `CustodialKeyStore`; when none is stored at startup a fresh account is
//! created on the ledger and persisted.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use super::{AccountKeys, LedgerClient};
use crate::error::{DatabaseError, Error};
use crate::store::Database;

const ADDRESS_KEY: &str = "custodial_address";
const SIGNING_KEY_KEY: &str = "custodial_signing_key";

/// Where the custodial reward account's keys live.
#[async_trait]
pub trait CustodialKeyStore: Send + Sync {
    async fn load(&self) -> Result<Option<AccountKeys>, DatabaseError>;

    async fn save(&self, keys: &AccountKeys) -> Result<(), DatabaseError>;
}

/// Keys kept in the `settings` table.
pub struct SettingsKeyStore {
    db: Arc<dyn Database>,
}

impl SettingsKeyStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CustodialKeyStore for SettingsKeyStore {
    async fn load(&self) -> Result<Option<AccountKeys>, DatabaseError> {
        let address = self.db.get_setting(ADDRESS_KEY).await?;
        let key = self.db.get_setting(SIGNING_KEY_KEY).await?;
        match (address, key) {
            (Some(address), Some(key)) => Ok(Some(AccountKeys {
                address,
                signing_key: SecretString::from(key),
            })),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Custodial account settings are incomplete, ignoring them");
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }

    async fn save(&self, keys: &AccountKeys) -> Result<(), DatabaseError> {
        // Key first so a crash in between never leaves an address without one.
        self.db
            .set_setting(SIGNING_KEY_KEY, keys.signing_key.expose_secret())
            .await?;
        self.db.set_setting(ADDRESS_KEY, &keys.address).await
    }
}

/// In-process key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Option<AccountKeys>>,
}

impl MemoryKeyStore {
    pub fn new(keys: Option<AccountKeys>) -> Self {
        Self {
            keys: Mutex::new(keys),
        }
    }
}

#[async_trait]
impl CustodialKeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Option<AccountKeys>, DatabaseError> {
        let guard = self
            .keys
            .lock()
            .map_err(|_| DatabaseError::Pool("custodial key store poisoned".into()))?;
        Ok(guard.clone())
    }

    async fn save(&self, keys: &AccountKeys) -> Result<(), DatabaseError> {
        let mut guard = self
            .keys
            .lock()
            .map_err(|_| DatabaseError::Pool("custodial key store poisoned".into()))?;
        *guard = Some(keys.clone());
        Ok(())
    }
}

/// Load the custodial account, creating and storing one if none exists.
pub async fn ensure_custodial_account(
    store: &dyn CustodialKeyStore,
    ledger: &dyn LedgerClient,
) -> Result<AccountKeys, Error> {
    if let Some(keys) = store.load().await? {
        return Ok(keys);
    }

    let keys = ledger.create_account().await?;
    store.save(&keys).await?;
    info!(address = %keys.address, "Created custodial reward account; fund it before rewards can be paid");
    Ok(keys)
}

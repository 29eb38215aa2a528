//! Hand-written fakes for the external collaborators, shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;

use crate::error::{ChannelError, LedgerError};
use crate::ledger::{AccountKeys, CredentialMetadata, LedgerClient, MintReceipt};
use crate::notify::Notifier;

/// In-memory ledger that counts calls and fails on request.
#[derive(Default)]
pub struct FakeLedger {
    pub creates: AtomicUsize,
    pub transfers: Mutex<Vec<(String, Decimal)>>,
    pub mints: Mutex<Vec<(String, CredentialMetadata)>>,
    create_failures: Mutex<VecDeque<LedgerError>>,
    transfer_failures: Mutex<VecDeque<LedgerError>>,
    mint_failures: Mutex<VecDeque<LedgerError>>,
    transfer_delay: Mutex<Option<Duration>>,
    pub balance: Mutex<Decimal>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self, e: LedgerError) {
        self.create_failures.lock().unwrap().push_back(e);
    }

    pub fn fail_next_transfer(&self, e: LedgerError) {
        self.transfer_failures.lock().unwrap().push_back(e);
    }

    pub fn fail_next_mint(&self, e: LedgerError) {
        self.mint_failures.lock().unwrap().push_back(e);
    }

    pub fn delay_transfers(&self, delay: Duration) {
        *self.transfer_delay.lock().unwrap() = Some(delay);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    pub fn mint_count(&self) -> usize {
        self.mints.lock().unwrap().len()
    }
}

pub fn unavailable(operation: &str) -> LedgerError {
    LedgerError::Unavailable {
        operation: operation.into(),
        reason: "connection refused".into(),
    }
}

pub fn indeterminate(operation: &str) -> LedgerError {
    LedgerError::Indeterminate {
        operation: operation.into(),
        reason: "timed out".into(),
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn create_account(&self) -> Result<AccountKeys, LedgerError> {
        if let Some(e) = self.create_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(AccountKeys {
            address: format!("0xacct{n}"),
            signing_key: SecretString::from(format!("key{n}")),
        })
    }

    async fn transfer(
        &self,
        _signing_key: &SecretString,
        to: &str,
        amount: Decimal,
    ) -> Result<String, LedgerError> {
        let delay = *self.transfer_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.transfer_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let mut transfers = self.transfers.lock().unwrap();
        transfers.push((to.to_string(), amount));
        Ok(format!("0xtx{}", transfers.len()))
    }

    async fn mint_credential(
        &self,
        to: &str,
        metadata: &CredentialMetadata,
    ) -> Result<MintReceipt, LedgerError> {
        if let Some(e) = self.mint_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let mut mints = self.mints.lock().unwrap();
        mints.push((to.to_string(), metadata.clone()));
        Ok(MintReceipt {
            token_id: mints.len().to_string(),
            transaction_ref: format!("0xmint{}", mints.len()),
        })
    }

    async fn get_balance(&self, _signing_key: &SecretString) -> Result<Decimal, LedgerError> {
        Ok(*self.balance.lock().unwrap())
    }
}

/// Notifier that records every message and always succeeds.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}

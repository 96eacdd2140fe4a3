//! Seams between the workflows and everything they do not own: persistence and
//! the external blockchain, payment, storage and mail services.

use super::credit::{CarbonCredit, CreditId};
use super::document::{Document, DocumentId, ScanStatus};
use super::money::{Money, Quantity};
use super::payment::{Payment, PaymentId, Receipt};
use super::transaction::{SettlementStep, Transaction, TransactionId};
use super::user::{User, UserId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn store(&self, user: User) -> Result<()>;
    async fn get(&self, id: UserId) -> Result<Option<User>>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn get_all(&self) -> Result<Vec<User>>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Session {
    pub user: UserId,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn store(&self, token: &str, session: Session) -> Result<()>;
    async fn get(&self, token: &str) -> Result<Option<Session>>;
    async fn remove(&self, token: &str) -> Result<()>;
    /// Drops every session of `user`, returning how many were removed.
    async fn revoke_user(&self, user: UserId) -> Result<usize>;
    /// Drops every session that expired at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Inserts or overwrites unconditionally.
    async fn store(&self, credit: CarbonCredit) -> Result<()>;
    /// Writes `credit` only if the stored copy is still at `expected_version`.
    ///
    /// Returns `false` when another writer got there first; the caller must
    /// reload and retry.
    async fn compare_and_store(&self, credit: CarbonCredit, expected_version: u64) -> Result<bool>;
    async fn get(&self, id: CreditId) -> Result<Option<CarbonCredit>>;
    async fn get_all(&self) -> Result<Vec<CarbonCredit>>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn store(&self, document: Document) -> Result<()>;
    async fn get(&self, id: DocumentId) -> Result<Option<Document>>;
    async fn get_all(&self) -> Result<Vec<Document>>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn store(&self, tx: Transaction) -> Result<()>;
    /// Writes `tx` only if the stored copy is still at step `expected`.
    ///
    /// Returns `false` when another writer moved the transaction first.
    async fn compare_and_store(&self, tx: Transaction, expected: SettlementStep) -> Result<bool>;
    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>>;
    async fn find_by_idempotency_key(&self, buyer: UserId, key: &str)
    -> Result<Option<Transaction>>;
    async fn get_all(&self) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a new payment; fails with `Conflict` if its transaction already
    /// has one or its on-chain hash already paid for another transaction.
    async fn insert(&self, payment: Payment) -> Result<()>;
    async fn store(&self, payment: Payment) -> Result<()>;
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>>;
    async fn find_by_transaction(&self, tx: TransactionId) -> Result<Option<Payment>>;
    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<Payment>>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Stores `receipt` unless its payment already has one; either way the
    /// receipt now on record is returned.
    async fn insert_if_absent(&self, receipt: Receipt) -> Result<(Receipt, bool)>;
    async fn store(&self, receipt: Receipt) -> Result<()>;
    async fn find_by_payment(&self, payment: PaymentId) -> Result<Option<Receipt>>;
}

pub type UserStoreRef = Arc<dyn UserStore>;
pub type SessionStoreRef = Arc<dyn SessionStore>;
pub type CreditStoreRef = Arc<dyn CreditStore>;
pub type DocumentStoreRef = Arc<dyn DocumentStore>;
pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type ReceiptStoreRef = Arc<dyn ReceiptStore>;

/// Every store the marketplace needs, usually backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub users: UserStoreRef,
    pub sessions: SessionStoreRef,
    pub credits: CreditStoreRef,
    pub documents: DocumentStoreRef,
    pub transactions: TransactionStoreRef,
    pub payments: PaymentStoreRef,
    pub receipts: ReceiptStoreRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintRequest {
    pub credit_id: CreditId,
    pub project_name: String,
    pub verifier: String,
    pub expiry_date: NaiveDate,
    pub total_credits: Quantity,
    pub owner_wallet: String,
    pub metadata_uri: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub token_id: String,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub token_id: String,
    pub from: String,
    pub to: String,
    pub amount: Quantity,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetireRequest {
    pub token_id: String,
    pub holder: String,
    pub amount: Quantity,
    pub idempotency_key: String,
}

/// The credit token contract, reached through a blockchain node.
///
/// Every state-changing call carries an idempotency key; submitting the same
/// key twice must not execute the operation twice.
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    async fn mint(&self, request: MintRequest) -> Result<MintReceipt>;
    async fn transfer(&self, request: TransferRequest) -> Result<String>;
    async fn retire(&self, request: RetireRequest) -> Result<String>;
    /// Checks that `tx_hash` paid `amount` for `token_id`.
    async fn verify_payment(&self, tx_hash: &str, amount: Money, token_id: &str) -> Result<bool>;
    /// Looks up a transfer previously submitted with `idempotency_key`.
    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub intent_id: String,
    pub client_secret: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: ChargeRequest) -> Result<Charge>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn scan(&self, content: &[u8]) -> Result<ScanStatus>;
    async fn store(&self, key: &str, content: Vec<u8>, content_type: &str) -> Result<()>;
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

pub type BlockchainRef = Arc<dyn BlockchainClient>;
pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;
pub type ObjectStorageRef = Arc<dyn ObjectStorage>;
pub type NotifierRef = Arc<dyn Notifier>;

/// Handles to the external services.
#[derive(Clone)]
pub struct Services {
    pub blockchain: BlockchainRef,
    pub gateway: PaymentGatewayRef,
    pub storage: ObjectStorageRef,
    pub notifier: NotifierRef,
}

use crate::domain::credit::{CarbonCredit, CreditId};
use crate::domain::document::{Document, DocumentId};
use crate::domain::payment::{Payment, PaymentId, Receipt};
use crate::domain::ports::{
    CreditStore, DocumentStore, PaymentStore, ReceiptStore, Session, SessionStore, Stores,
    TransactionStore, UserStore,
};
use crate::domain::transaction::{SettlementStep, Transaction, TransactionId};
use crate::domain::user::{User, UserId};
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const CF_USERS: &str = "users";
pub const CF_SESSIONS: &str = "sessions";
pub const CF_CREDITS: &str = "credits";
pub const CF_DOCUMENTS: &str = "documents";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_PAYMENTS: &str = "payments";
/// Receipts are keyed by their payment id.
pub const CF_RECEIPTS: &str = "receipts";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_USERS,
    CF_SESSIONS,
    CF_CREDITS,
    CF_DOCUMENTS,
    CF_TRANSACTIONS,
    CF_PAYMENTS,
    CF_RECEIPTS,
];

/// A persistent store for every marketplace entity, one column family each,
/// values encoded as JSON.
///
/// `Clone` shares the underlying `Arc<DB>`. Conditional writes
/// (`compare_and_store`, `insert`, `insert_if_absent`) are serialized through
/// a shared lock so the check and the write cannot interleave.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a database at `path`, creating missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Wraps this database as a full set of stores.
    pub fn stores(&self) -> Stores {
        Stores {
            users: Arc::new(self.clone()),
            sessions: Arc::new(self.clone()),
            credits: Arc::new(self.clone()),
            documents: Arc::new(self.clone()),
            transactions: Arc::new(self.clone()),
            payments: Arc::new(self.clone()),
            receipts: Arc::new(self.clone()),
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            MarketError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.cf(cf)?;
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(handle, key, bytes)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Box<[u8]>, T)>> {
        let handle = self.cf(cf)?;
        let mut items = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            items.push((key, serde_json::from_slice(&value)?));
        }
        Ok(items)
    }

    fn values<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        Ok(self.scan(cf)?.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl UserStore for RocksDBStore {
    async fn store(&self, user: User) -> Result<()> {
        self.put(CF_USERS, user.id.as_bytes(), &user)
    }

    async fn get(&self, id: UserId) -> Result<Option<User>> {
        self.fetch(CF_USERS, id.as_bytes())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .values::<User>(CF_USERS)?
            .into_iter()
            .find(|u| u.username == username))
    }

    async fn get_all(&self) -> Result<Vec<User>> {
        self.values(CF_USERS)
    }
}

#[async_trait]
impl SessionStore for RocksDBStore {
    async fn store(&self, token: &str, session: Session) -> Result<()> {
        self.put(CF_SESSIONS, token.as_bytes(), &session)
    }

    async fn get(&self, token: &str) -> Result<Option<Session>> {
        self.fetch(CF_SESSIONS, token.as_bytes())
    }

    async fn remove(&self, token: &str) -> Result<()> {
        let handle = self.cf(CF_SESSIONS)?;
        self.db.delete_cf(handle, token.as_bytes())?;
        Ok(())
    }

    async fn revoke_user(&self, user: UserId) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let handle = self.cf(CF_SESSIONS)?;
        let mut revoked = 0;
        for (key, session) in self.scan::<Session>(CF_SESSIONS)? {
            if session.user == user {
                self.db.delete_cf(handle, key)?;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let handle = self.cf(CF_SESSIONS)?;
        let mut purged = 0;
        for (key, session) in self.scan::<Session>(CF_SESSIONS)? {
            if session.expires_at <= now {
                self.db.delete_cf(handle, key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[async_trait]
impl CreditStore for RocksDBStore {
    async fn store(&self, credit: CarbonCredit) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.put(CF_CREDITS, credit.id.as_bytes(), &credit)
    }

    async fn compare_and_store(&self, credit: CarbonCredit, expected_version: u64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current: CarbonCredit = self
            .fetch(CF_CREDITS, credit.id.as_bytes())?
            .ok_or_else(|| MarketError::not_found(format!("Credit {}", credit.id)))?;
        if current.version != expected_version {
            return Ok(false);
        }
        self.put(CF_CREDITS, credit.id.as_bytes(), &credit)?;
        Ok(true)
    }

    async fn get(&self, id: CreditId) -> Result<Option<CarbonCredit>> {
        self.fetch(CF_CREDITS, id.as_bytes())
    }

    async fn get_all(&self) -> Result<Vec<CarbonCredit>> {
        self.values(CF_CREDITS)
    }
}

#[async_trait]
impl DocumentStore for RocksDBStore {
    async fn store(&self, document: Document) -> Result<()> {
        self.put(CF_DOCUMENTS, document.id.as_bytes(), &document)
    }

    async fn get(&self, id: DocumentId) -> Result<Option<Document>> {
        self.fetch(CF_DOCUMENTS, id.as_bytes())
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        self.values(CF_DOCUMENTS)
    }
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.put(CF_TRANSACTIONS, tx.id.as_bytes(), &tx)
    }

    async fn compare_and_store(&self, tx: Transaction, expected: SettlementStep) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current: Transaction = self
            .fetch(CF_TRANSACTIONS, tx.id.as_bytes())?
            .ok_or_else(|| MarketError::not_found(format!("Transaction {}", tx.id)))?;
        if current.step != expected {
            return Ok(false);
        }
        self.put(CF_TRANSACTIONS, tx.id.as_bytes(), &tx)?;
        Ok(true)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.fetch(CF_TRANSACTIONS, id.as_bytes())
    }

    async fn find_by_idempotency_key(
        &self,
        buyer: UserId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .values::<Transaction>(CF_TRANSACTIONS)?
            .into_iter()
            .find(|tx| tx.buyer == buyer && tx.idempotency_key == key))
    }

    async fn get_all(&self) -> Result<Vec<Transaction>> {
        self.values(CF_TRANSACTIONS)
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let existing = self.values::<Payment>(CF_PAYMENTS)?;
        if existing.iter().any(|p| p.transaction == payment.transaction) {
            return Err(MarketError::Conflict(format!(
                "Transaction {} already has a payment",
                payment.transaction
            )));
        }
        if let Some(hash) = payment.crypto_tx_hash.as_deref() {
            if existing.iter().any(|p| p.crypto_tx_hash.as_deref() == Some(hash)) {
                return Err(MarketError::Conflict(format!(
                    "Blockchain transaction {hash} was already used for a payment"
                )));
            }
        }
        self.put(CF_PAYMENTS, payment.id.as_bytes(), &payment)
    }

    async fn store(&self, payment: Payment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.put(CF_PAYMENTS, payment.id.as_bytes(), &payment)
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.fetch(CF_PAYMENTS, id.as_bytes())
    }

    async fn find_by_transaction(&self, tx: TransactionId) -> Result<Option<Payment>> {
        Ok(self
            .values::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .find(|p| p.transaction == tx))
    }

    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<Payment>> {
        Ok(self
            .values::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .find(|p| p.gateway_intent_id.as_deref() == Some(intent_id)))
    }
}

#[async_trait]
impl ReceiptStore for RocksDBStore {
    async fn insert_if_absent(&self, receipt: Receipt) -> Result<(Receipt, bool)> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.fetch::<Receipt>(CF_RECEIPTS, receipt.payment.as_bytes())? {
            return Ok((existing, false));
        }
        self.put(CF_RECEIPTS, receipt.payment.as_bytes(), &receipt)?;
        Ok((receipt, true))
    }

    async fn store(&self, receipt: Receipt) -> Result<()> {
        self.put(CF_RECEIPTS, receipt.payment.as_bytes(), &receipt)
    }

    async fn find_by_payment(&self, payment: PaymentId) -> Result<Option<Receipt>> {
        self.fetch(CF_RECEIPTS, payment.as_bytes())
    }
}

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
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for users.
///
/// Uses `Arc<RwLock<HashMap<..>>>` to allow shared concurrent access.
#[derive(Default, Clone)]
pub struct InMemoryUserStore {
    users: Arc<RwLock<HashMap<UserId, User>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn store(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;
        users.insert(user.id, user);
        Ok(())
    }

    async fn get(&self, id: UserId) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.username == username).cloned())
    }

    async fn get_all(&self) -> Result<Vec<User>> {
        let users = self.users.read().await;
        Ok(users.values().cloned().collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn store(&self, token: &str, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(token.to_string(), session);
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(token).cloned())
    }

    async fn remove(&self, token: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
        Ok(())
    }

    async fn revoke_user(&self, user: UserId) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.user != user);
        Ok(before - sessions.len())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        Ok(before - sessions.len())
    }
}

/// In-memory credit store.
///
/// `compare_and_store` checks the version and writes under the same write
/// lock, so it behaves like a row-level compare-and-swap.
#[derive(Default, Clone)]
pub struct InMemoryCreditStore {
    credits: Arc<RwLock<HashMap<CreditId, CarbonCredit>>>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn store(&self, credit: CarbonCredit) -> Result<()> {
        let mut credits = self.credits.write().await;
        credits.insert(credit.id, credit);
        Ok(())
    }

    async fn compare_and_store(&self, credit: CarbonCredit, expected_version: u64) -> Result<bool> {
        let mut credits = self.credits.write().await;
        match credits.get(&credit.id) {
            Some(current) if current.version != expected_version => Ok(false),
            None => Err(MarketError::not_found(format!("Credit {}", credit.id))),
            Some(_) => {
                credits.insert(credit.id, credit);
                Ok(true)
            }
        }
    }

    async fn get(&self, id: CreditId) -> Result<Option<CarbonCredit>> {
        let credits = self.credits.read().await;
        Ok(credits.get(&id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<CarbonCredit>> {
        let credits = self.credits.read().await;
        Ok(credits.values().cloned().collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryDocumentStore {
    documents: Arc<RwLock<HashMap<DocumentId, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn store(&self, document: Document) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents.insert(document.id, document);
        Ok(())
    }

    async fn get(&self, id: DocumentId) -> Result<Option<Document>> {
        let documents = self.documents.read().await;
        Ok(documents.get(&id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        let documents = self.documents.read().await;
        Ok(documents.values().cloned().collect())
    }
}

/// In-memory transaction history, essential for idempotent purchase handling
/// and for reconciling in-flight settlements.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn compare_and_store(&self, tx: Transaction, expected: SettlementStep) -> Result<bool> {
        let mut transactions = self.transactions.write().await;
        match transactions.get(&tx.id) {
            Some(current) if current.step != expected => Ok(false),
            None => Err(MarketError::not_found(format!("Transaction {}", tx.id))),
            Some(_) => {
                transactions.insert(tx.id, tx);
                Ok(true)
            }
        }
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        buyer: UserId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .find(|t| t.buyer == buyer && t.idempotency_key == key)
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.values().cloned().collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<PaymentId, Payment>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments
            .values()
            .any(|p| p.transaction == payment.transaction)
        {
            return Err(MarketError::Conflict(format!(
                "Transaction {} already has a payment",
                payment.transaction
            )));
        }
        if let Some(hash) = payment.crypto_tx_hash.as_deref() {
            if payments.values().any(|p| p.crypto_tx_hash.as_deref() == Some(hash)) {
                return Err(MarketError::Conflict(format!(
                    "Blockchain transaction {hash} was already used for a payment"
                )));
            }
        }
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn store(&self, payment: Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&id).cloned())
    }

    async fn find_by_transaction(&self, tx: TransactionId) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.values().find(|p| p.transaction == tx).cloned())
    }

    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|p| p.gateway_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryReceiptStore {
    receipts: Arc<RwLock<HashMap<PaymentId, Receipt>>>,
}

impl InMemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReceiptStore for InMemoryReceiptStore {
    async fn insert_if_absent(&self, receipt: Receipt) -> Result<(Receipt, bool)> {
        let mut receipts = self.receipts.write().await;
        if let Some(existing) = receipts.get(&receipt.payment) {
            return Ok((existing.clone(), false));
        }
        receipts.insert(receipt.payment, receipt.clone());
        Ok((receipt, true))
    }

    async fn store(&self, receipt: Receipt) -> Result<()> {
        let mut receipts = self.receipts.write().await;
        receipts.insert(receipt.payment, receipt);
        Ok(())
    }

    async fn find_by_payment(&self, payment: PaymentId) -> Result<Option<Receipt>> {
        let receipts = self.receipts.read().await;
        Ok(receipts.get(&payment).cloned())
    }
}

/// Builds a full set of empty in-memory stores.
pub fn in_memory_stores() -> Stores {
    Stores {
        users: Arc::new(InMemoryUserStore::new()),
        sessions: Arc::new(InMemorySessionStore::new()),
        credits: Arc::new(InMemoryCreditStore::new()),
        documents: Arc::new(InMemoryDocumentStore::new()),
        transactions: Arc::new(InMemoryTransactionStore::new()),
        payments: Arc::new(InMemoryPaymentStore::new()),
        receipts: Arc::new(InMemoryReceiptStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credit::NewCredit;
    use crate::domain::money::{Money, Quantity};
    use crate::domain::user::Role;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn credit() -> CarbonCredit {
        CarbonCredit::issue(
            Uuid::new_v4(),
            NewCredit {
                project_name: "Reforestation".into(),
                verifier: "Verra".into(),
                issuance_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                expiry_date: NaiveDate::from_ymd_opt(2028, 3, 1).unwrap(),
                total_credits: Quantity::new(dec!(100)).unwrap(),
                price_per_credit: dec!(9.99),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_user_store() {
        let store = InMemoryUserStore::new();
        let user = User::new("seller1", "seller1@example.com", Role::Seller);

        store.store(user.clone()).await.unwrap();
        assert_eq!(store.get(user.id).await.unwrap().unwrap(), user);
        assert_eq!(
            store.find_by_username("seller1").await.unwrap().unwrap().id,
            user.id
        );
        assert!(store.find_by_username("nobody").await.unwrap().is_none());
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_store_rejects_stale_version() {
        let store = InMemoryCreditStore::new();
        let original = credit();
        store.store(original.clone()).await.unwrap();

        let mut first = original.clone();
        first.reserve(Quantity::new(dec!(10)).unwrap()).unwrap();
        assert!(store.compare_and_store(first, original.version).await.unwrap());

        let mut stale = original.clone();
        stale.reserve(Quantity::new(dec!(20)).unwrap()).unwrap();
        assert!(!store.compare_and_store(stale, original.version).await.unwrap());

        let stored = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(stored.available_credits, dec!(90));
    }

    #[tokio::test]
    async fn test_session_revocation() {
        let store = InMemorySessionStore::new();
        let user = Uuid::new_v4();
        let session = Session {
            user,
            expires_at: chrono::Utc::now(),
        };
        store.store("a", session.clone()).await.unwrap();
        store.store("b", session).await.unwrap();
        assert_eq!(store.revoke_user(user).await.unwrap(), 2);
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_sessions() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        store
            .store(
                "old",
                Session {
                    user,
                    expires_at: now - chrono::Duration::seconds(1),
                },
            )
            .await
            .unwrap();
        store
            .store(
                "fresh",
                Session {
                    user,
                    expires_at: now + chrono::Duration::hours(1),
                },
            )
            .await
            .unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_payment_insert_is_unique_per_transaction() {
        let store = InMemoryPaymentStore::new();
        let tx = Uuid::new_v4();
        let amount = Money::new(dec!(10)).unwrap();
        let first = Payment::new(tx, crate::domain::payment::PaymentType::Fiat, amount, dec!(0.02));
        let second =
            Payment::new(tx, crate::domain::payment::PaymentType::Crypto, amount, dec!(0.02));

        store.insert(first).await.unwrap();
        assert!(matches!(
            store.insert(second).await,
            Err(MarketError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_crypto_hash_pays_once() {
        let store = InMemoryPaymentStore::new();
        let amount = Money::new(dec!(10)).unwrap();
        let mut first = Payment::new(
            Uuid::new_v4(),
            crate::domain::payment::PaymentType::Crypto,
            amount,
            dec!(0.02),
        );
        first.crypto_tx_hash = Some("0xabc".into());
        let mut second = first.clone();
        second.id = Uuid::new_v4();
        second.transaction = Uuid::new_v4();

        store.insert(first).await.unwrap();
        assert!(matches!(
            store.insert(second).await,
            Err(MarketError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_step_compare_and_store() {
        let store = InMemoryTransactionStore::new();
        let mut tx = Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Quantity::new(dec!(1)).unwrap(),
            Money::price(dec!(5)).unwrap(),
            None,
        );
        tx.begin_transfer();
        store.store(tx.clone()).await.unwrap();

        let mut released = tx.clone();
        released.fail("timeout");
        assert!(
            store
                .compare_and_store(released, SettlementStep::Transferring)
                .await
                .unwrap()
        );

        let mut late = tx.clone();
        late.complete("0xlate".into());
        assert!(
            !store
                .compare_and_store(late, SettlementStep::Transferring)
                .await
                .unwrap()
        );
        let stored = store.get(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.step, SettlementStep::Released);
    }

    #[tokio::test]
    async fn test_receipt_insert_if_absent() {
        let store = InMemoryReceiptStore::new();
        let payment = Uuid::new_v4();
        let (first, created) = store.insert_if_absent(Receipt::new(payment)).await.unwrap();
        assert!(created);
        let (again, created) = store.insert_if_absent(Receipt::new(payment)).await.unwrap();
        assert!(!created);
        assert_eq!(again.receipt_number, first.receipt_number);
    }
}

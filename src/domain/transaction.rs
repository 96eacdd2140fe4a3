use super::credit::CreditId;
use super::money::{Money, Quantity};
use super::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TransactionId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Last persisted step of a purchase settlement.
///
/// `Reserved` and `Transferring` are the only in-flight steps; a transaction
/// left in either after a crash is picked up by the reconciler.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStep {
    #[default]
    Reserved,
    Transferring,
    Completed,
    Released,
}

impl SettlementStep {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Reserved | Self::Transferring)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub buyer: UserId,
    pub seller: UserId,
    pub carbon_credit: CreditId,
    pub quantity: Quantity,
    pub price_per_credit: Money,
    pub total_amount: Money,
    pub status: TransactionStatus,
    pub step: SettlementStep,
    pub idempotency_key: String,
    pub blockchain_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        buyer: UserId,
        seller: UserId,
        carbon_credit: CreditId,
        quantity: Quantity,
        price_per_credit: Money,
        idempotency_key: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            buyer,
            seller,
            carbon_credit,
            quantity,
            price_per_credit,
            total_amount: price_per_credit * quantity,
            status: TransactionStatus::Pending,
            step: SettlementStep::Reserved,
            idempotency_key: idempotency_key.unwrap_or_else(|| id.to_string()),
            blockchain_tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.buyer == user || self.seller == user
    }

    pub fn begin_transfer(&mut self) {
        self.step = SettlementStep::Transferring;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, tx_hash: String) {
        self.blockchain_tx_hash = Some(tx_hash);
        self.failure_reason = None;
        self.status = TransactionStatus::Completed;
        self.step = SettlementStep::Completed;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = TransactionStatus::Failed;
        self.step = SettlementStep::Released;
        self.failure_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(key: Option<String>) -> Transaction {
        Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Quantity::new(dec!(3)).unwrap(),
            Money::price(dec!(10.10)).unwrap(),
            key,
        )
    }

    #[test]
    fn test_total_amount_and_defaults() {
        let t = tx(None);
        assert_eq!(t.total_amount.value(), dec!(30.30));
        assert_eq!(t.status, TransactionStatus::Pending);
        assert_eq!(t.idempotency_key, t.id.to_string());
        assert!(t.step.is_in_flight());
    }

    #[test]
    fn test_explicit_idempotency_key() {
        let t = tx(Some("order-7".into()));
        assert_eq!(t.idempotency_key, "order-7");
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut t = tx(None);
        t.begin_transfer();
        t.fail("reverted");
        assert_eq!(t.status, TransactionStatus::Failed);
        assert_eq!(t.step, SettlementStep::Released);
        assert!(!t.step.is_in_flight());
        assert!(t.blockchain_tx_hash.is_none());
    }
}

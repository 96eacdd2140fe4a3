use super::money::Money;
use super::transaction::TransactionId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PaymentId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Fiat,
    Crypto,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: PaymentId,
    pub transaction: TransactionId,
    pub payment_type: PaymentType,
    pub amount: Money,
    pub fee_amount: Money,
    pub total_amount: Money,
    pub status: PaymentStatus,
    pub gateway_intent_id: Option<String>,
    pub crypto_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Builds a pending payment, charging the platform fee on top of `amount`.
    pub fn new(
        transaction: TransactionId,
        payment_type: PaymentType,
        amount: Money,
        fee_rate: Decimal,
    ) -> Self {
        let fee_amount = amount.percent(fee_rate);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            transaction,
            payment_type,
            amount,
            fee_amount,
            total_amount: amount + fee_amount,
            status: PaymentStatus::Pending,
            gateway_intent_id: None,
            crypto_tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: PaymentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Receipt {
    pub id: Uuid,
    pub payment: PaymentId,
    pub receipt_number: String,
    pub document_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Receipt {
    pub fn new(payment: PaymentId) -> Self {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let short: String = id.simple().to_string().chars().take(8).collect();
        Self {
            id,
            payment,
            receipt_number: format!("RCP-{}-{}", created_at.format("%Y%m%d"), short),
            document_url: None,
            created_at,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("receipts/{}.json", self.receipt_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fee_calculation() {
        let payment = Payment::new(
            Uuid::new_v4(),
            PaymentType::Fiat,
            Money::new(dec!(250.00)).unwrap(),
            dec!(0.02),
        );
        assert_eq!(payment.fee_amount.value(), dec!(5.00));
        assert_eq!(payment.total_amount.value(), dec!(255.00));
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_receipt_number_format() {
        let receipt = Receipt::new(Uuid::new_v4());
        let parts: Vec<&str> = receipt.receipt_number.split('-').collect();
        assert_eq!(parts[0], "RCP");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert!(receipt.id.simple().to_string().starts_with(parts[2]));
    }
}

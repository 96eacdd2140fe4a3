//! Fiat and crypto payment for completed purchases, plus receipts.
//!
//! A transaction has at most one payment and a payment at most one receipt;
//! both are enforced by the stores, so duplicate webhook deliveries and
//! concurrent requests collapse onto the records already there.

use super::external::with_retry;
use crate::config::{MarketConfig, PaymentConfig, SettlementConfig};
use crate::domain::payment::{Payment, PaymentId, PaymentStatus, PaymentType, Receipt};
use crate::domain::ports::{
    BlockchainRef, ChargeRequest, CreditStoreRef, Notification, NotifierRef, ObjectStorageRef,
    PaymentGatewayRef, PaymentStoreRef, ReceiptStoreRef, Services, Stores, TransactionStoreRef,
    UserStoreRef,
};
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::domain::user::{Role, User, UserId};
use crate::error::{MarketError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// What the client needs to confirm a card payment with the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiatPaymentIntent {
    pub payment_id: PaymentId,
    pub client_secret: String,
    pub amount: Decimal,
    pub fee_amount: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CryptoPaymentOutcome {
    pub verified: bool,
    pub payment: Option<Payment>,
    pub receipt: Option<Receipt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Completed(Receipt),
    Failed(PaymentId),
    Ignored(String),
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
}

/// Signature the gateway sends in `x-gateway-signature`: hex SHA-256 of the
/// shared secret followed by the raw body.
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

fn signatures_match(expected: &str, given: &str) -> bool {
    let given = given.trim().to_ascii_lowercase();
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

pub struct PaymentService {
    users: UserStoreRef,
    credits: CreditStoreRef,
    transactions: TransactionStoreRef,
    payments: PaymentStoreRef,
    receipts: ReceiptStoreRef,
    gateway: PaymentGatewayRef,
    blockchain: BlockchainRef,
    storage: ObjectStorageRef,
    notifier: NotifierRef,
    config: PaymentConfig,
    settlement: SettlementConfig,
    receipt_url_ttl: Duration,
}

impl PaymentService {
    pub fn new(stores: &Stores, services: &Services, config: &MarketConfig) -> Self {
        Self {
            users: stores.users.clone(),
            credits: stores.credits.clone(),
            transactions: stores.transactions.clone(),
            payments: stores.payments.clone(),
            receipts: stores.receipts.clone(),
            gateway: services.gateway.clone(),
            blockchain: services.blockchain.clone(),
            storage: services.storage.clone(),
            notifier: services.notifier.clone(),
            config: config.payments.clone(),
            settlement: config.settlement.clone(),
            receipt_url_ttl: config.documents.download_url_ttl(),
        }
    }

    async fn paid_transaction(&self, buyer: &User, id: TransactionId) -> Result<Transaction> {
        buyer.require_role(&[Role::Buyer])?;
        let tx = self
            .transactions
            .get(id)
            .await?
            .filter(|tx| tx.buyer == buyer.id)
            .ok_or_else(|| MarketError::not_found(format!("Transaction {id}")))?;
        if tx.status != TransactionStatus::Completed {
            return Err(MarketError::validation(
                "Only completed transactions can be paid",
            ));
        }
        if let Some(existing) = self.payments.find_by_transaction(id).await? {
            if existing.status == PaymentStatus::Completed {
                return Err(MarketError::Conflict("Transaction is already paid".into()));
            }
        }
        Ok(tx)
    }

    /// Opens a card charge for a completed purchase.
    ///
    /// Repeating the call returns the same charge; the gateway sees one
    /// idempotency key per transaction.
    pub async fn create_fiat_payment(&self, buyer: &User, id: TransactionId) -> Result<FiatPaymentIntent> {
        let tx = self.paid_transaction(buyer, id).await?;
        let mut payment = match self.payments.find_by_transaction(id).await? {
            Some(existing) if existing.payment_type == PaymentType::Fiat => existing,
            Some(_) => {
                return Err(MarketError::Conflict(
                    "Transaction already has a crypto payment".into(),
                ));
            }
            None => Payment::new(
                tx.id,
                PaymentType::Fiat,
                tx.total_amount,
                self.settlement.platform_fee_rate,
            ),
        };

        let metadata = BTreeMap::from([
            ("transaction_id".to_string(), tx.id.to_string()),
            ("payment_id".to_string(), payment.id.to_string()),
            ("buyer_id".to_string(), buyer.id.to_string()),
        ]);
        let charge = self
            .gateway
            .create_charge(ChargeRequest {
                amount_cents: payment.total_amount.cents(),
                currency: self.config.currency.clone(),
                metadata,
                idempotency_key: format!("payment-{}", tx.id),
            })
            .await
            .map_err(|e| match e {
                MarketError::PaymentError(_) => e,
                other => MarketError::PaymentError(other.to_string()),
            })?;

        if payment.gateway_intent_id.is_none() {
            payment.gateway_intent_id = Some(charge.intent_id.clone());
            match self.payments.insert(payment.clone()).await {
                Ok(()) => {}
                Err(MarketError::Conflict(_)) => {
                    payment = self
                        .payments
                        .find_by_transaction(id)
                        .await?
                        .ok_or_else(|| MarketError::internal("Payment vanished after conflict"))?;
                }
                Err(e) => return Err(e),
            }
        }
        info!(payment = %payment.id, tx = %tx.id, intent = %charge.intent_id, total = %payment.total_amount, "fiat payment created");

        Ok(FiatPaymentIntent {
            payment_id: payment.id,
            client_secret: charge.client_secret,
            amount: payment.amount.value(),
            fee_amount: payment.fee_amount.value(),
            total_amount: payment.total_amount.value(),
        })
    }

    /// Checks an on-chain payment and, if it covers the amount due, records it.
    pub async fn process_crypto_payment(
        &self,
        buyer: &User,
        id: TransactionId,
        tx_hash: &str,
    ) -> Result<CryptoPaymentOutcome> {
        if tx_hash.trim().is_empty() {
            return Err(MarketError::validation("Transaction hash is required"));
        }
        let tx = self.paid_transaction(buyer, id).await?;
        let credit = self
            .credits
            .get(tx.carbon_credit)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Credit {}", tx.carbon_credit)))?;
        let token_id = credit.token()?.to_string();

        let mut payment = Payment::new(
            tx.id,
            PaymentType::Crypto,
            tx.total_amount,
            self.settlement.platform_fee_rate,
        );
        let due = payment.total_amount;
        let chain = &self.blockchain;
        let verified = with_retry(&self.settlement, "verify payment", || {
            chain.verify_payment(tx_hash, due, &token_id)
        })
        .await?;
        if !verified {
            warn!(tx = %tx.id, hash = %tx_hash, "crypto payment could not be verified");
            return Ok(CryptoPaymentOutcome {
                verified: false,
                payment: None,
                receipt: None,
            });
        }

        payment.crypto_tx_hash = Some(tx_hash.to_string());
        payment.set_status(PaymentStatus::Completed);
        self.payments.insert(payment.clone()).await?;
        info!(payment = %payment.id, tx = %tx.id, hash = %tx_hash, "crypto payment verified");
        let receipt = self.issue_receipt(&payment, tx.buyer).await?;

        Ok(CryptoPaymentOutcome {
            verified: true,
            payment: Some(payment),
            receipt: Some(receipt),
        })
    }

    /// Applies a gateway event. Unknown event types are acknowledged and ignored.
    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let expected = sign_webhook(&self.config.webhook_secret, body);
        if !signatures_match(&expected, signature) {
            warn!("webhook rejected: bad signature");
            return Err(MarketError::SecurityError(
                "Invalid webhook signature".into(),
            ));
        }
        let event: WebhookEvent = serde_json::from_slice(body)?;
        let intent = event.data.object.id;

        match event.kind.as_str() {
            "payment_intent.succeeded" => {
                let mut payment = self.payment_for_intent(&intent).await?;
                if payment.status != PaymentStatus::Completed {
                    payment.set_status(PaymentStatus::Completed);
                    self.payments.store(payment.clone()).await?;
                    info!(payment = %payment.id, %intent, "fiat payment succeeded");
                }
                let buyer = self.buyer_of(&payment).await?;
                Ok(WebhookOutcome::Completed(
                    self.issue_receipt(&payment, buyer).await?,
                ))
            }
            "payment_intent.payment_failed" => {
                let mut payment = self.payment_for_intent(&intent).await?;
                if payment.status == PaymentStatus::Pending {
                    payment.set_status(PaymentStatus::Failed);
                    self.payments.store(payment.clone()).await?;
                    warn!(payment = %payment.id, %intent, "fiat payment failed");
                }
                Ok(WebhookOutcome::Failed(payment.id))
            }
            other => {
                info!(event = %other, "ignoring webhook event");
                Ok(WebhookOutcome::Ignored(other.to_string()))
            }
        }
    }

    async fn payment_for_intent(&self, intent: &str) -> Result<Payment> {
        self.payments
            .find_by_intent(intent)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Payment for intent {intent}")))
    }

    async fn buyer_of(&self, payment: &Payment) -> Result<UserId> {
        self.transactions
            .get(payment.transaction)
            .await?
            .map(|tx| tx.buyer)
            .ok_or_else(|| MarketError::not_found(format!("Transaction {}", payment.transaction)))
    }

    /// Returns the payment's receipt, creating it on first call.
    ///
    /// The rendered receipt goes to object storage; if that fails the receipt
    /// is still recorded, just without a document URL.
    pub async fn issue_receipt(&self, payment: &Payment, buyer: UserId) -> Result<Receipt> {
        let (mut receipt, created) = self
            .receipts
            .insert_if_absent(Receipt::new(payment.id))
            .await?;
        if !created {
            return Ok(receipt);
        }

        let rendered = serde_json::to_vec_pretty(&serde_json::json!({
            "receipt_number": receipt.receipt_number,
            "payment_id": payment.id,
            "transaction_id": payment.transaction,
            "payment_type": payment.payment_type,
            "amount": payment.amount,
            "fee_amount": payment.fee_amount,
            "total_amount": payment.total_amount,
            "issued_at": receipt.created_at,
        }))?;
        let key = receipt.storage_key();
        let stored = async {
            self.storage
                .store(&key, rendered, "application/json")
                .await?;
            self.storage.signed_url(&key, self.receipt_url_ttl).await
        };
        match stored.await {
            Ok(url) => {
                receipt.document_url = Some(url);
                self.receipts.store(receipt.clone()).await?;
            }
            Err(e) => warn!(receipt = %receipt.receipt_number, error = %e, "failed to store receipt document"),
        }
        info!(receipt = %receipt.receipt_number, payment = %payment.id, "receipt issued");

        if let Ok(Some(user)) = self.users.get(buyer).await {
            let notice = Notification {
                to: user.email,
                subject: format!("Payment receipt {}", receipt.receipt_number),
                body: format!(
                    "We received your payment of {} (including a {} platform fee).",
                    payment.total_amount, payment.fee_amount
                ),
            };
            if let Err(e) = self.notifier.notify(notice).await {
                warn!(receipt = %receipt.receipt_number, error = %e, "failed to send payment confirmation");
            }
        }
        Ok(receipt)
    }
}

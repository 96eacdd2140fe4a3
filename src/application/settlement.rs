//! Purchase settlement.
//!
//! A purchase moves through reserve, transfer and complete. The reserved
//! quantity is taken out of the listing before the chain call, so concurrent
//! buyers can never oversell a credit, and every exit path either completes
//! the transaction or hands the quantity back.

use super::credits::update_credit;
use super::external::{with_retry, with_timeout};
use crate::config::SettlementConfig;
use crate::domain::credit::{CarbonCredit, CreditId};
use crate::domain::money::Quantity;
use crate::domain::ports::{
    BlockchainRef, CreditStoreRef, TransactionStoreRef, TransferRequest, UserStoreRef,
};
use crate::domain::transaction::{SettlementStep, Transaction, TransactionId};
use crate::domain::user::{Role, User, UserId};
use crate::error::{MarketError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PurchaseRequest {
    pub credit_id: CreditId,
    pub quantity: Quantity,
}

/// Result of moving a stored transaction out of its in-flight step.
#[derive(Debug)]
pub(crate) enum Transition {
    Applied(Transaction),
    /// Someone else settled it first; holds the stored copy.
    AlreadySettled(Transaction),
}

impl Transition {
    pub(crate) fn into_transaction(self) -> Transaction {
        match self {
            Self::Applied(tx) | Self::AlreadySettled(tx) => tx,
        }
    }
}

pub struct SettlementService {
    users: UserStoreRef,
    credits: CreditStoreRef,
    transactions: TransactionStoreRef,
    blockchain: BlockchainRef,
    config: SettlementConfig,
    in_progress: Mutex<HashSet<(UserId, String)>>,
    /// Transactions a `purchase` call in this process is still driving.
    live: Mutex<HashSet<TransactionId>>,
}

impl SettlementService {
    pub fn new(
        users: UserStoreRef,
        credits: CreditStoreRef,
        transactions: TransactionStoreRef,
        blockchain: BlockchainRef,
        config: SettlementConfig,
    ) -> Self {
        Self {
            users,
            credits,
            transactions,
            blockchain,
            config,
            in_progress: Mutex::new(HashSet::new()),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a purchase in this process is still settling `id`.
    pub async fn is_live(&self, id: TransactionId) -> bool {
        self.live.lock().await.contains(&id)
    }

    /// Buys `request.quantity` of a listed credit for `buyer`.
    ///
    /// With an `idempotency_key`, a repeated request returns the transaction
    /// recorded the first time instead of buying again.
    pub async fn purchase(
        &self,
        buyer: &User,
        request: PurchaseRequest,
        idempotency_key: Option<String>,
    ) -> Result<Transaction> {
        buyer.require_role(&[Role::Buyer])?;
        let buyer_wallet = buyer.wallet()?.to_string();

        let Some(key) = idempotency_key else {
            return self.settle(buyer, &buyer_wallet, &request, None).await;
        };
        if key.trim().is_empty() || key.len() > 255 {
            return Err(MarketError::validation(
                "Idempotency key must be 1 to 255 characters",
            ));
        }
        if let Some(existing) = self
            .transactions
            .find_by_idempotency_key(buyer.id, &key)
            .await?
        {
            return Self::replay(existing, &request);
        }

        let slot = (buyer.id, key.clone());
        if !self.in_progress.lock().await.insert(slot.clone()) {
            return Err(MarketError::Conflict(
                "A purchase with this idempotency key is already in progress".into(),
            ));
        }
        let result = match self
            .transactions
            .find_by_idempotency_key(buyer.id, &key)
            .await
        {
            Ok(Some(existing)) => Self::replay(existing, &request),
            Ok(None) => self.settle(buyer, &buyer_wallet, &request, Some(key)).await,
            Err(e) => Err(e),
        };
        self.in_progress.lock().await.remove(&slot);
        result
    }

    fn replay(existing: Transaction, request: &PurchaseRequest) -> Result<Transaction> {
        if existing.carbon_credit != request.credit_id || existing.quantity != request.quantity {
            return Err(MarketError::Conflict(
                "Idempotency key was already used for a different purchase".into(),
            ));
        }
        Ok(existing)
    }

    async fn settle(
        &self,
        buyer: &User,
        buyer_wallet: &str,
        request: &PurchaseRequest,
        idempotency_key: Option<String>,
    ) -> Result<Transaction> {
        let credit = self
            .credits
            .get(request.credit_id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Credit {}", request.credit_id)))?;
        Self::check_purchasable(&credit, buyer, request.quantity)?;
        let token_id = credit.token()?.to_string();
        let seller = self
            .users
            .get(credit.owner)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("User {}", credit.owner)))?;
        let seller_wallet = seller.wallet()?.to_string();

        let attempts = self.config.max_reservation_attempts;
        let quantity = request.quantity;
        let reserved = update_credit(&self.credits, credit.id, attempts, |c| {
            Self::check_purchasable(c, buyer, quantity)?;
            c.reserve(quantity)
        })
        .await?;

        let tx = Transaction::new(
            buyer.id,
            reserved.owner,
            reserved.id,
            quantity,
            reserved.price_per_credit,
            idempotency_key,
        );
        let transfer = TransferRequest {
            token_id,
            from: seller_wallet,
            to: buyer_wallet.to_string(),
            amount: quantity,
            idempotency_key: tx.idempotency_key.clone(),
        };
        let id = tx.id;
        self.live.lock().await.insert(id);
        let result = self.transfer(tx, transfer).await;
        self.live.lock().await.remove(&id);
        result
    }

    async fn transfer(&self, mut tx: Transaction, transfer: TransferRequest) -> Result<Transaction> {
        let attempts = self.config.max_reservation_attempts;
        let quantity = tx.quantity;
        if let Err(e) = self.transactions.store(tx.clone()).await {
            error!(credit = %tx.carbon_credit, error = %e, "failed to record purchase, releasing reservation");
            update_credit(&self.credits, tx.carbon_credit, attempts, |c| c.release(quantity)).await?;
            return Err(e);
        }
        info!(tx = %tx.id, credit = %tx.carbon_credit, buyer = %tx.buyer, %quantity, "credits reserved");

        tx.begin_transfer();
        if !self
            .transactions
            .compare_and_store(tx.clone(), SettlementStep::Reserved)
            .await?
        {
            return Err(MarketError::Conflict(format!(
                "Transaction {} was settled before its transfer started",
                tx.id
            )));
        }

        let chain = &self.blockchain;
        let e = match with_retry(&self.config, "transfer", || chain.transfer(transfer.clone())).await {
            Ok(tx_hash) => {
                return self
                    .complete(tx, tx_hash)
                    .await
                    .map(Transition::into_transaction);
            }
            Err(e) => e,
        };
        // a timed-out call may still have gone through
        match self.lookup_transfer(&tx).await {
            Ok(Some(tx_hash)) => {
                warn!(tx = %tx.id, error = %e, "transfer reported failure but was executed");
                self.complete(tx, tx_hash)
                    .await
                    .map(Transition::into_transaction)
            }
            Ok(None) => {
                let settled = self.compensate(tx, &e.to_string()).await?.into_transaction();
                if settled.step == SettlementStep::Completed {
                    return Ok(settled);
                }
                Err(match e {
                    MarketError::BlockchainError(_) => e,
                    other => MarketError::BlockchainError(other.to_string()),
                })
            }
            Err(lookup) => {
                error!(tx = %tx.id, error = %lookup, "transfer outcome unknown, leaving for reconciliation");
                Err(e)
            }
        }
    }

    /// Asks the chain for the transfer submitted under `tx`'s idempotency key.
    pub(crate) async fn lookup_transfer(&self, tx: &Transaction) -> Result<Option<String>> {
        with_timeout(
            self.config.call_timeout(),
            "transfer lookup",
            self.blockchain.find_transfer(&tx.idempotency_key),
        )
        .await
    }

    fn check_purchasable(credit: &CarbonCredit, buyer: &User, quantity: Quantity) -> Result<()> {
        if credit.owner == buyer.id {
            return Err(MarketError::validation("Cannot purchase your own credits"));
        }
        if !credit.is_listed() {
            return Err(MarketError::validation("Credit is not available for purchase"));
        }
        if quantity.value() > credit.available_credits {
            return Err(MarketError::validation("Insufficient credits available"));
        }
        Ok(())
    }

    async fn stored(&self, id: TransactionId) -> Result<Transaction> {
        self.transactions
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Transaction {id}")))
    }

    /// Applies `change` to the stored copy of transaction `id` if it is still
    /// in flight, retrying when another writer moves it in between.
    async fn transition<F>(&self, id: TransactionId, change: F) -> Result<Transition>
    where
        F: Fn(&mut Transaction),
    {
        for _ in 0..self.config.max_reservation_attempts {
            let current = self.stored(id).await?;
            if !current.step.is_in_flight() {
                return Ok(Transition::AlreadySettled(current));
            }
            let mut next = current.clone();
            change(&mut next);
            if self.transactions.compare_and_store(next.clone(), current.step).await? {
                return Ok(Transition::Applied(next));
            }
        }
        Err(MarketError::Conflict(format!(
            "Transaction {id} is being settled concurrently"
        )))
    }

    /// Marks `tx` completed. A transaction that was already released gets its
    /// quantity taken out of the listing again, since the tokens did move.
    pub(crate) async fn complete(&self, tx: Transaction, tx_hash: String) -> Result<Transition> {
        match self.transition(tx.id, |t| t.complete(tx_hash.clone())).await? {
            Transition::Applied(tx) => {
                info!(tx = %tx.id, hash = ?tx.blockchain_tx_hash, "purchase completed");
                Ok(Transition::Applied(tx))
            }
            Transition::AlreadySettled(current) if current.step == SettlementStep::Released => {
                self.reclaim(current, tx_hash).await
            }
            settled => Ok(settled),
        }
    }

    async fn reclaim(&self, released: Transaction, tx_hash: String) -> Result<Transition> {
        error!(tx = %released.id, hash = %tx_hash, "transfer landed after its reservation was released");
        let attempts = self.config.max_reservation_attempts;
        let quantity = released.quantity;
        update_credit(&self.credits, released.carbon_credit, attempts, |c| c.reserve(quantity)).await?;

        let mut completed = released.clone();
        completed.complete(tx_hash);
        if self
            .transactions
            .compare_and_store(completed.clone(), SettlementStep::Released)
            .await?
        {
            info!(tx = %completed.id, "late transfer recorded, reservation taken back");
            return Ok(Transition::Applied(completed));
        }
        update_credit(&self.credits, released.carbon_credit, attempts, |c| c.release(quantity)).await?;
        Ok(Transition::AlreadySettled(self.stored(released.id).await?))
    }

    /// Fails the transaction and returns the reserved quantity to the listing.
    ///
    /// The step is claimed before the quantity moves, so of two concurrent
    /// callers only one releases it. If the transaction was already settled
    /// the stored copy is returned untouched.
    pub(crate) async fn compensate(&self, tx: Transaction, reason: &str) -> Result<Transition> {
        let tx = match self.transition(tx.id, |t| t.fail(reason)).await? {
            Transition::Applied(tx) => tx,
            Transition::AlreadySettled(current) => {
                info!(tx = %current.id, step = ?current.step, "transaction already settled, nothing to release");
                return Ok(Transition::AlreadySettled(current));
            }
        };
        let quantity = tx.quantity;
        if let Err(e) = update_credit(
            &self.credits,
            tx.carbon_credit,
            self.config.max_reservation_attempts,
            |c| c.release(quantity),
        )
        .await
        {
            error!(tx = %tx.id, credit = %tx.carbon_credit, error = %e, "failed to release reservation of a failed purchase");
            return Err(e);
        }
        warn!(tx = %tx.id, credit = %tx.carbon_credit, %reason, "purchase failed, reservation released");
        Ok(Transition::Applied(tx))
    }

    pub async fn get(&self, user: &User, id: TransactionId) -> Result<Transaction> {
        let tx = self
            .transactions
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Transaction {id}")))?;
        if user.is_admin() || tx.involves(user.id) {
            Ok(tx)
        } else {
            Err(MarketError::not_found(format!("Transaction {id}")))
        }
    }

    /// Admins see every transaction, everyone else the ones they took part in.
    pub async fn list_transactions(&self, user: &User) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .transactions
            .get_all()
            .await?
            .into_iter()
            .filter(|tx| user.is_admin() || tx.involves(user.id))
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(txs)
    }
}

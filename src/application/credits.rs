use super::external::with_retry;
use crate::config::SettlementConfig;
use crate::domain::credit::{CarbonCredit, CreditId, CreditStatus, NewCredit};
use crate::domain::money::Quantity;
use crate::domain::ports::{BlockchainRef, CreditStoreRef, MintRequest, RetireRequest};
use crate::domain::user::{Role, User};
use crate::error::{MarketError, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyAction {
    Verify,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

pub const MAX_PAGE_SIZE: usize = 100;

/// Key under which a credit's mint is submitted, shared by issuance and the
/// document approval job so the token is only ever minted once.
pub fn mint_key(credit: CreditId) -> String {
    format!("mint-{credit}")
}

pub fn mint_request(
    credit: &CarbonCredit,
    owner_wallet: &str,
    metadata_uri: &str,
) -> Result<MintRequest> {
    Ok(MintRequest {
        credit_id: credit.id,
        project_name: credit.project_name.clone(),
        verifier: credit.verifier.clone(),
        expiry_date: credit.expiry_date,
        total_credits: Quantity::new(credit.total_credits)?,
        owner_wallet: owner_wallet.to_string(),
        metadata_uri: metadata_uri.to_string(),
        idempotency_key: mint_key(credit.id),
    })
}

/// Applies `change` to the stored credit with optimistic concurrency.
///
/// The closure runs against a fresh copy each attempt; the write only lands if
/// nobody else updated the credit in between.
pub async fn update_credit<F>(
    credits: &CreditStoreRef,
    id: CreditId,
    max_attempts: u32,
    mut change: F,
) -> Result<CarbonCredit>
where
    F: FnMut(&mut CarbonCredit) -> Result<()>,
{
    for _ in 0..max_attempts {
        let current = credits
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Credit {id}")))?;
        let mut updated = current.clone();
        change(&mut updated)?;
        if credits.compare_and_store(updated.clone(), current.version).await? {
            return Ok(updated);
        }
    }
    Err(MarketError::Conflict(format!(
        "Credit {id} is being updated concurrently, try again"
    )))
}

pub struct CreditService {
    credits: CreditStoreRef,
    blockchain: BlockchainRef,
    config: SettlementConfig,
}

impl CreditService {
    pub fn new(credits: CreditStoreRef, blockchain: BlockchainRef, config: SettlementConfig) -> Self {
        Self {
            credits,
            blockchain,
            config,
        }
    }

    /// Persists a new credit and mints its token.
    ///
    /// If minting fails the credit stays on record as rejected.
    pub async fn issue(&self, owner: &User, new: NewCredit) -> Result<CarbonCredit> {
        owner.require_role(&[Role::Seller, Role::Admin])?;
        let wallet = owner.wallet()?.to_string();
        let mut credit = CarbonCredit::issue(owner.id, new)?;
        self.credits.store(credit.clone()).await?;
        info!(credit = %credit.id, owner = %owner.id, total = %credit.total_credits, "credit issued");

        let request = mint_request(&credit, &wallet, &format!("credits/{}", credit.id))?;
        let chain = &self.blockchain;
        match with_retry(&self.config, "mint", || chain.mint(request.clone())).await {
            Ok(receipt) => {
                credit.tokenize(receipt.token_id);
                self.credits.store(credit.clone()).await?;
                info!(credit = %credit.id, token = ?credit.token_id, tx = %receipt.tx_hash, "credit tokenized");
                Ok(credit)
            }
            Err(e) => {
                error!(credit = %credit.id, error = %e, "blockchain error while minting credit");
                credit.set_status(CreditStatus::Rejected);
                self.credits.store(credit).await?;
                Err(match e {
                    MarketError::BlockchainError(_) => e,
                    other => MarketError::BlockchainError(other.to_string()),
                })
            }
        }
    }

    /// Admins see every credit, everyone else only their own.
    pub async fn list(&self, user: &User) -> Result<Vec<CarbonCredit>> {
        let mut credits: Vec<CarbonCredit> = self
            .credits
            .get_all()
            .await?
            .into_iter()
            .filter(|c| user.is_admin() || c.owner == user.id)
            .collect();
        credits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(credits)
    }

    pub async fn get(&self, user: &User, id: CreditId) -> Result<CarbonCredit> {
        let credit = self.load(id).await?;
        if user.is_admin() || credit.owner == user.id || credit.is_listed() {
            Ok(credit)
        } else {
            Err(MarketError::not_found(format!("Credit {id}")))
        }
    }

    pub(crate) async fn load(&self, id: CreditId) -> Result<CarbonCredit> {
        self.credits
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("Credit {id}")))
    }

    /// Verified, tokenized credits with something left to sell, oldest first.
    pub async fn listings(&self, page: usize, page_size: usize) -> Result<Page<CarbonCredit>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let mut listed: Vec<CarbonCredit> = self
            .credits
            .get_all()
            .await?
            .into_iter()
            .filter(CarbonCredit::is_listed)
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let total = listed.len();
        let items = listed
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        Ok(Page {
            items,
            page,
            page_size,
            total,
        })
    }

    pub async fn verify(&self, admin: &User, id: CreditId, action: VerifyAction) -> Result<CarbonCredit> {
        admin.require_role(&[Role::Admin])?;
        let credit = update_credit(
            &self.credits,
            id,
            self.config.max_reservation_attempts,
            |credit| {
                if credit.status == CreditStatus::Retired {
                    return Err(MarketError::Conflict("Credit is retired".into()));
                }
                match action {
                    VerifyAction::Verify => {
                        credit.token()?;
                        credit.set_status(CreditStatus::Verified);
                    }
                    VerifyAction::Reject => credit.set_status(CreditStatus::Rejected),
                }
                Ok(())
            },
        )
        .await?;
        info!(credit = %id, admin = %admin.id, ?action, "credit reviewed");
        Ok(credit)
    }

    /// Burns part of the owner's unsold balance on chain.
    ///
    /// The quantity is reserved first so no purchase can take it while the
    /// chain call is in flight; a failed burn gives it back.
    pub async fn retire(&self, owner: &User, id: CreditId, quantity: Quantity) -> Result<CarbonCredit> {
        let credit = self.load(id).await?;
        if credit.owner != owner.id {
            return Err(MarketError::forbidden("Only the owner can retire credits"));
        }
        owner.require_role(&[Role::Seller, Role::Admin])?;
        let wallet = owner.wallet()?.to_string();
        let token_id = credit.token()?.to_string();

        let attempts = self.config.max_reservation_attempts;
        update_credit(&self.credits, id, attempts, |c| c.reserve(quantity)).await?;

        let request = RetireRequest {
            token_id,
            holder: wallet,
            amount: quantity,
            idempotency_key: format!("retire-{}", Uuid::new_v4()),
        };
        let chain = &self.blockchain;
        match with_retry(&self.config, "retire", || chain.retire(request.clone())).await {
            Ok(tx_hash) => {
                let credit = update_credit(&self.credits, id, attempts, |c| {
                    c.confirm_retirement(quantity);
                    Ok(())
                })
                .await?;
                info!(credit = %id, %quantity, tx = %tx_hash, "credits retired");
                Ok(credit)
            }
            Err(e) => {
                error!(credit = %id, error = %e, "retirement failed, releasing reservation");
                update_credit(&self.credits, id, attempts, |c| c.release(quantity)).await?;
                Err(e)
            }
        }
    }
}

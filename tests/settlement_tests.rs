mod common;

use carbon_market::application::settlement::PurchaseRequest;
use carbon_market::domain::credit::CreditStatus;
use carbon_market::domain::ports::CreditStore;
use carbon_market::domain::transaction::{SettlementStep, TransactionStatus};
use carbon_market::domain::user::Role;
use carbon_market::error::MarketError;
use common::{BUYER_WALLET, Harness, SELLER_WALLET, qty};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

#[tokio::test]
async fn test_purchase_settles_on_chain() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.listed_credit(&seller, &admin, dec!(1000), dec!(15.50)).await;

    let tx = h
        .market
        .settlement
        .purchase(
            &buyer,
            PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(100)),
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.step, SettlementStep::Completed);
    assert_eq!(tx.total_amount.value(), dec!(1550.00));
    assert_eq!(tx.seller, seller.id);

    let token = credit.token_id.clone().unwrap();
    assert_eq!(h.sim.blockchain.balance(&token, BUYER_WALLET).await, dec!(100));
    assert_eq!(h.sim.blockchain.balance(&token, SELLER_WALLET).await, dec!(900));

    let stored = h.stores.credits.get(credit.id).await.unwrap().unwrap();
    assert_eq!(stored.available_credits, dec!(900));
    assert_eq!(stored.total_credits, dec!(1000));
}

#[tokio::test]
async fn test_buying_out_a_credit_removes_it_from_listings() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.listed_credit(&seller, &admin, dec!(5), dec!(10)).await;
    assert_eq!(h.market.credits.listings(1, 20).await.unwrap().total, 1);

    h.market
        .settlement
        .purchase(
            &buyer,
            PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(5)),
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.market.credits.listings(1, 20).await.unwrap().total, 0);
    let stored = h.stores.credits.get(credit.id).await.unwrap().unwrap();
    assert_eq!(stored.available_credits, Decimal::ZERO);
    assert_eq!(stored.status, CreditStatus::Verified);
}

#[tokio::test]
async fn test_over_quantity_purchase_makes_no_chain_call() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.listed_credit(&seller, &admin, dec!(50), dec!(10)).await;

    let result = h
        .market
        .settlement
        .purchase(
            &buyer,
            PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(50.01)),
            },
            None,
        )
        .await;

    assert!(matches!(result, Err(MarketError::ValidationError(_))));
    assert_eq!(h.sim.blockchain.transfer_calls(), 0);
    assert!(h.market.settlement.list_transactions(&buyer).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_transfer_is_never_completed() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.listed_credit(&seller, &admin, dec!(100), dec!(10)).await;
    h.sim.blockchain.fail_transfers(u32::MAX);

    let result = h
        .market
        .settlement
        .purchase(
            &buyer,
            PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(10)),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(MarketError::BlockchainError(_))));
    // one attempt plus max_retries
    assert_eq!(h.sim.blockchain.transfer_calls(), 3);

    let txs = h.market.settlement.list_transactions(&buyer).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].status, TransactionStatus::Failed);
    assert!(txs[0].blockchain_tx_hash.is_none());
    assert!(txs[0].failure_reason.is_some());

    let stored = h.stores.credits.get(credit.id).await.unwrap().unwrap();
    assert_eq!(stored.available_credits, dec!(100));
}

#[tokio::test]
async fn test_timed_out_transfer_is_released() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.listed_credit(&seller, &admin, dec!(20), dec!(1)).await;
    h.sim.blockchain.set_latency(Duration::from_secs(2));

    let result = h
        .market
        .settlement
        .purchase(
            &buyer,
            PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(4)),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(MarketError::BlockchainError(_))));

    let txs = h.market.settlement.list_transactions(&buyer).await.unwrap();
    assert_eq!(txs[0].status, TransactionStatus::Failed);
    let stored = h.stores.credits.get(credit.id).await.unwrap().unwrap();
    assert_eq!(stored.available_credits, dec!(20));
}

#[tokio::test]
async fn test_concurrent_buyers_never_overdraw() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let credit = h.listed_credit(&seller, &admin, dec!(100), dec!(10)).await;

    let mut buyers = Vec::new();
    for i in 0..8 {
        let wallet = format!("0x{:040x}", i + 1);
        buyers.push(h.user(&format!("buyer{i}"), Role::Buyer, Some(&wallet)).await);
    }

    let mut handles = Vec::new();
    for buyer in buyers {
        for _ in 0..3 {
            let market = h.market.clone();
            let buyer = buyer.clone();
            let request = PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(7)),
            };
            handles.push(tokio::spawn(async move {
                market.settlement.purchase(&buyer, request, None).await
            }));
        }
    }

    let mut sold = Decimal::ZERO;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(tx) => {
                assert_eq!(tx.status, TransactionStatus::Completed);
                sold += tx.quantity.value();
            }
            Err(e) => assert!(
                matches!(e, MarketError::ValidationError(_) | MarketError::Conflict(_)),
                "unexpected error: {e}"
            ),
        }
    }

    let stored = h.stores.credits.get(credit.id).await.unwrap().unwrap();
    assert!(stored.available_credits >= Decimal::ZERO);
    assert!(stored.available_credits <= stored.total_credits);
    assert_eq!(stored.available_credits + sold, dec!(100));
    let token = credit.token_id.unwrap();
    assert_eq!(h.sim.blockchain.balance(&token, SELLER_WALLET).await, stored.available_credits);
}

#[tokio::test]
async fn test_idempotent_purchase_retry() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.listed_credit(&seller, &admin, dec!(100), dec!(10)).await;
    let request = || PurchaseRequest {
        credit_id: credit.id,
        quantity: qty(dec!(10)),
    };

    let first = h
        .market
        .settlement
        .purchase(&buyer, request(), Some("checkout-1".into()))
        .await
        .unwrap();
    let retried = h
        .market
        .settlement
        .purchase(&buyer, request(), Some("checkout-1".into()))
        .await
        .unwrap();

    assert_eq!(first.id, retried.id);
    assert_eq!(h.sim.blockchain.transfer_calls(), 1);
    let stored = h.stores.credits.get(credit.id).await.unwrap().unwrap();
    assert_eq!(stored.available_credits, dec!(90));
}

#[tokio::test]
async fn test_purchase_requires_buyer_with_wallet() {
    let h = Harness::new();
    let admin = h.admin().await;
    let seller = h.seller().await;
    let credit = h.listed_credit(&seller, &admin, dec!(10), dec!(10)).await;
    let request = || PurchaseRequest {
        credit_id: credit.id,
        quantity: qty(dec!(1)),
    };

    let walletless = h.user("buyer2", Role::Buyer, None).await;
    assert!(matches!(
        h.market.settlement.purchase(&walletless, request(), None).await,
        Err(MarketError::ValidationError(_))
    ));
    assert!(matches!(
        h.market.settlement.purchase(&seller, request(), None).await,
        Err(MarketError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_unverified_credit_cannot_be_bought() {
    let h = Harness::new();
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let credit = h.issued_credit(&seller, dec!(10), dec!(10)).await;

    let result = h
        .market
        .settlement
        .purchase(
            &buyer,
            PurchaseRequest {
                credit_id: credit.id,
                quantity: qty(dec!(1)),
            },
            None,
        )
        .await;
    assert!(matches!(result, Err(MarketError::ValidationError(_))));
    assert_eq!(h.sim.blockchain.transfer_calls(), 0);
}

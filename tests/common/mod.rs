#![allow(dead_code)]

use carbon_market::application::Marketplace;
use carbon_market::application::auth::Registration;
use carbon_market::application::credits::VerifyAction;
use carbon_market::config::{MarketConfig, SettlementConfig};
use carbon_market::domain::credit::{CarbonCredit, NewCredit};
use carbon_market::domain::money::Quantity;
use carbon_market::domain::ports::Stores;
use carbon_market::domain::user::{Role, User};
use carbon_market::infrastructure::in_memory::in_memory_stores;
use carbon_market::infrastructure::simulated::SimulatedServices;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const SELLER_WALLET: &str = "0x1234567890123456789012345678901234567890";
pub const BUYER_WALLET: &str = "0x2345678901234567890123456789012345678901";
pub const PASSWORD: &str = "correct-horse-battery";

/// Short timeouts and backoff so failure paths finish quickly.
pub fn fast_config() -> MarketConfig {
    let mut config = MarketConfig::default();
    config.settlement = SettlementConfig {
        call_timeout_ms: 500,
        max_retries: 2,
        base_backoff_ms: 1,
        ..SettlementConfig::default()
    };
    config.reconciliation.grace_secs = 0;
    config.payments.webhook_secret = "whsec_test".into();
    config
}

pub struct Harness {
    pub market: Arc<Marketplace>,
    pub sim: SimulatedServices,
    pub stores: Stores,
    pub config: MarketConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: MarketConfig) -> Self {
        let stores = in_memory_stores();
        let sim = SimulatedServices::default();
        let market = Arc::new(Marketplace::new(stores.clone(), sim.services(), &config));
        Self {
            market,
            sim,
            stores,
            config,
        }
    }

    pub async fn user(&self, username: &str, role: Role, wallet: Option<&str>) -> User {
        self.market
            .auth
            .create_user(
                Registration {
                    username: username.into(),
                    email: format!("{username}@example.com"),
                    password: PASSWORD.into(),
                    role,
                    organization_name: String::new(),
                    organization_type: String::new(),
                    wallet_address: wallet.map(str::to_string),
                },
                true,
            )
            .await
            .unwrap()
    }

    pub async fn admin(&self) -> User {
        self.user("admin", Role::Admin, None).await
    }

    pub async fn seller(&self) -> User {
        self.user("seller1", Role::Seller, Some(SELLER_WALLET)).await
    }

    pub async fn buyer(&self) -> User {
        self.user("buyer1", Role::Buyer, Some(BUYER_WALLET)).await
    }

    /// Issues a tokenized credit for `seller` without verifying it.
    pub async fn issued_credit(&self, seller: &User, total: Decimal, price: Decimal) -> CarbonCredit {
        self.market
            .credits
            .issue(seller, new_credit(total, price))
            .await
            .unwrap()
    }

    /// Issues and verifies a credit so it shows up in listings.
    pub async fn listed_credit(&self, seller: &User, admin: &User, total: Decimal, price: Decimal) -> CarbonCredit {
        let credit = self.issued_credit(seller, total, price).await;
        self.market
            .credits
            .verify(admin, credit.id, VerifyAction::Verify)
            .await
            .unwrap()
    }

    pub async fn wait_for_jobs(&self) {
        assert!(
            self.market.jobs.wait_idle(Duration::from_secs(10)).await,
            "approval jobs did not finish"
        );
    }
}

pub fn new_credit(total: Decimal, price: Decimal) -> NewCredit {
    NewCredit {
        project_name: "Solar Farm Project".into(),
        verifier: "Verra".into(),
        issuance_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        expiry_date: NaiveDate::from_ymd_opt(2030, 12, 31).unwrap(),
        total_credits: Quantity::new(total).unwrap(),
        price_per_credit: price,
    }
}

pub fn qty(value: Decimal) -> Quantity {
    Quantity::new(value).unwrap()
}

pub fn generate_users_csv(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["username", "email", "password", "role"])?;
    for i in 1..=rows {
        wtr.write_record([
            format!("buyer{i}"),
            format!("buyer{i}@example.com"),
            PASSWORD.to_string(),
            "buyer".to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

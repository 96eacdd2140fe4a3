use crate::error::{MarketError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Runtime configuration, loaded from a JSON file or built from defaults.
///
/// Every section is optional in the file; missing fields keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MarketConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub documents: DocumentConfig,
    pub settlement: SettlementConfig,
    pub jobs: JobConfig,
    pub reconciliation: ReconciliationConfig,
    pub payments: PaymentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_secs: u64,
    pub min_password_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            min_password_len: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DocumentConfig {
    pub max_upload_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub download_url_ttl_secs: u64,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            allowed_content_types: vec![
                "application/pdf".into(),
                "image/jpeg".into(),
                "image/png".into(),
            ],
            download_url_ttl_secs: 3600,
        }
    }
}

impl DocumentConfig {
    pub fn download_url_ttl(&self) -> Duration {
        Duration::from_secs(self.download_url_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettlementConfig {
    /// Upper bound for any single blockchain call.
    pub call_timeout_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub platform_fee_rate: Decimal,
    /// Attempts at the optimistic credit update before giving up.
    pub max_reservation_attempts: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            max_retries: 3,
            base_backoff_ms: 200,
            platform_fee_rate: dec!(0.02),
            max_reservation_attempts: 16,
        }
    }
}

impl SettlementConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Longest a purchase can spend between starting its transfer and settling:
    /// every attempt timing out, the backoff between them, and the final
    /// lookup of the transfer's outcome.
    pub fn worst_case_settlement(&self) -> Duration {
        let calls = self.max_retries.saturating_add(2);
        let backoff: Duration = (1..=self.max_retries).map(|attempt| self.backoff(attempt)).sum();
        self.call_timeout().saturating_mul(calls) + backoff
    }

    /// Delay before retry number `attempt` (starting at 1), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    /// In-flight settlements younger than this are left alone.
    pub grace_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PaymentConfig {
    pub currency: String,
    pub webhook_secret: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            currency: "usd".into(),
            webhook_secret: "whsec_development".into(),
        }
    }
}

impl MarketConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.workers == 0 {
            return Err(MarketError::validation("jobs.workers must be at least 1"));
        }
        if self.jobs.queue_capacity == 0 {
            return Err(MarketError::validation(
                "jobs.queue_capacity must be at least 1",
            ));
        }
        if self.settlement.platform_fee_rate < Decimal::ZERO
            || self.settlement.platform_fee_rate >= Decimal::ONE
        {
            return Err(MarketError::validation(
                "settlement.platform_fee_rate must be in [0, 1)",
            ));
        }
        if self.settlement.max_reservation_attempts == 0 {
            return Err(MarketError::validation(
                "settlement.max_reservation_attempts must be at least 1",
            ));
        }
        let worst_case = self.settlement.worst_case_settlement();
        if Duration::from_secs(self.reconciliation.grace_secs) <= worst_case {
            return Err(MarketError::validation(format!(
                "reconciliation.grace_secs must exceed the longest settlement ({}ms)",
                worst_case.as_millis()
            )));
        }
        if self.payments.webhook_secret.is_empty() {
            return Err(MarketError::validation(
                "payments.webhook_secret must not be empty",
            ));
        }
        Ok(())
    }
}

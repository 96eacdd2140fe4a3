use super::money::{Money, Quantity};
use super::user::UserId;
use crate::error::MarketError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CreditId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CreditStatus {
    Pending,
    Verified,
    Rejected,
    Retired,
}

/// A batch of carbon offset capacity owned by one seller.
///
/// `available_credits` is what can still be sold; `retired_credits` has been
/// permanently burned by the owner. The invariant
/// `0 <= available_credits <= total_credits` holds after every operation, and
/// `version` increases on each change so stores can reject stale writes.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CarbonCredit {
    pub id: CreditId,
    pub project_name: String,
    pub verifier: String,
    pub owner: UserId,
    pub issuance_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub total_credits: Decimal,
    pub available_credits: Decimal,
    pub retired_credits: Decimal,
    pub token_id: Option<String>,
    pub status: CreditStatus,
    pub price_per_credit: Money,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by a seller when issuing a new credit.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NewCredit {
    pub project_name: String,
    pub verifier: String,
    pub issuance_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub total_credits: Quantity,
    pub price_per_credit: Decimal,
}

impl CarbonCredit {
    pub fn issue(owner: UserId, new: NewCredit) -> Result<Self, MarketError> {
        if new.project_name.trim().is_empty() {
            return Err(MarketError::validation("Project name is required"));
        }
        if new.verifier.trim().is_empty() {
            return Err(MarketError::validation("Verifier is required"));
        }
        if new.expiry_date <= new.issuance_date {
            return Err(MarketError::validation(
                "Expiry date must be after issuance date",
            ));
        }
        let price = Money::price(new.price_per_credit)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            project_name: new.project_name.trim().to_string(),
            verifier: new.verifier.trim().to_string(),
            owner,
            issuance_date: new.issuance_date,
            expiry_date: new.expiry_date,
            total_credits: new.total_credits.value(),
            available_credits: new.total_credits.value(),
            retired_credits: Decimal::ZERO,
            token_id: None,
            status: CreditStatus::Pending,
            price_per_credit: price,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// A credit can be bought only once verified and tokenized.
    pub fn is_listed(&self) -> bool {
        self.status == CreditStatus::Verified
            && self.token_id.is_some()
            && self.available_credits > Decimal::ZERO
    }

    pub fn token(&self) -> Result<&str, MarketError> {
        self.token_id
            .as_deref()
            .ok_or_else(|| MarketError::validation("Credit has not been tokenized"))
    }

    pub fn tokenize(&mut self, token_id: String) {
        self.token_id = Some(token_id);
        self.touch();
    }

    pub fn set_status(&mut self, status: CreditStatus) {
        self.status = status;
        self.touch();
    }

    /// Holds `quantity` for a pending purchase.
    pub fn reserve(&mut self, quantity: Quantity) -> Result<(), MarketError> {
        if quantity.value() > self.available_credits {
            return Err(MarketError::validation("Insufficient credits available"));
        }
        self.available_credits -= quantity.value();
        self.touch();
        Ok(())
    }

    /// Returns a reservation after a failed purchase.
    pub fn release(&mut self, quantity: Quantity) -> Result<(), MarketError> {
        let restored = self.available_credits + quantity.value();
        if restored > self.total_credits - self.retired_credits {
            return Err(MarketError::internal(format!(
                "Releasing {quantity} would exceed total credits of {}",
                self.id
            )));
        }
        self.available_credits = restored;
        self.touch();
        Ok(())
    }

    /// Books a retirement whose quantity was already taken out with [`reserve`].
    ///
    /// [`reserve`]: CarbonCredit::reserve
    pub fn confirm_retirement(&mut self, quantity: Quantity) {
        self.retired_credits += quantity.value();
        if self.available_credits.is_zero() {
            self.status = CreditStatus::Retired;
        }
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(total: Decimal) -> CarbonCredit {
        CarbonCredit::issue(
            Uuid::new_v4(),
            NewCredit {
                project_name: "Solar Farm Project".into(),
                verifier: "Verra".into(),
                issuance_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                expiry_date: NaiveDate::from_ymd_opt(2027, 1, 1).unwrap(),
                total_credits: Quantity::new(total).unwrap(),
                price_per_credit: dec!(15.50),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_issue_defaults() {
        let credit = sample(dec!(1000));
        assert_eq!(credit.available_credits, dec!(1000));
        assert_eq!(credit.status, CreditStatus::Pending);
        assert!(!credit.is_listed());
    }

    #[test]
    fn test_issue_rejects_bad_dates() {
        let result = CarbonCredit::issue(
            Uuid::new_v4(),
            NewCredit {
                project_name: "Wind".into(),
                verifier: "Gold Standard".into(),
                issuance_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                expiry_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                total_credits: Quantity::new(dec!(10)).unwrap(),
                price_per_credit: dec!(1),
            },
        );
        assert!(matches!(result, Err(MarketError::ValidationError(_))));
    }

    #[test]
    fn test_reserve_and_release() {
        let mut credit = sample(dec!(100));
        let q = Quantity::new(dec!(40)).unwrap();
        credit.reserve(q).unwrap();
        assert_eq!(credit.available_credits, dec!(60));
        assert_eq!(credit.version, 1);

        credit.release(q).unwrap();
        assert_eq!(credit.available_credits, dec!(100));
        assert!(credit.release(q).is_err());
        assert_eq!(credit.available_credits, dec!(100));
    }

    #[test]
    fn test_reserve_insufficient() {
        let mut credit = sample(dec!(10));
        let result = credit.reserve(Quantity::new(dec!(10.01)).unwrap());
        assert!(matches!(result, Err(MarketError::ValidationError(_))));
        assert_eq!(credit.available_credits, dec!(10));
    }

    #[test]
    fn test_retire_all_marks_retired() {
        let mut credit = sample(dec!(50));
        let half = Quantity::new(dec!(25)).unwrap();
        credit.reserve(half).unwrap();
        credit.confirm_retirement(half);
        assert_eq!(credit.retired_credits, dec!(25));
        assert_eq!(credit.status, CreditStatus::Pending);

        assert!(credit.reserve(Quantity::new(dec!(26)).unwrap()).is_err());
        credit.reserve(half).unwrap();
        credit.confirm_retirement(half);
        assert_eq!(credit.status, CreditStatus::Retired);
        assert_eq!(credit.available_credits, Decimal::ZERO);
        assert!(credit.available_credits <= credit.total_credits);
    }
}

use crate::error::MarketError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
    Admin,
}

/// A marketplace participant.
///
/// Sellers issue credits, buyers purchase them, admins verify credits and
/// review documents. Blocked users keep their records but can no longer act.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub wallet_address: Option<String>,
    pub organization_name: String,
    pub organization_type: String,
    pub password_hash: String,
    pub password_salt: String,
    pub is_verified: bool,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, email: &str, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            role,
            wallet_address: None,
            organization_name: String::new(),
            organization_type: String::new(),
            password_hash: String::new(),
            password_salt: String::new(),
            is_verified: false,
            is_blocked: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Fails if the user is blocked or does not hold one of `roles`.
    pub fn require_role(&self, roles: &[Role]) -> Result<(), MarketError> {
        if self.is_blocked {
            return Err(MarketError::forbidden("User is blocked"));
        }
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(MarketError::forbidden(format!(
                "Action not allowed for role {:?}",
                self.role
            )))
        }
    }

    /// On-chain address of the user, required for minting and transfers.
    pub fn wallet(&self) -> Result<&str, MarketError> {
        self.wallet_address
            .as_deref()
            .filter(|w| !w.is_empty())
            .ok_or_else(|| MarketError::validation("User has no wallet address"))
    }
}

/// Wallet addresses are 0x-prefixed, 20-byte hex strings.
pub fn validate_wallet_address(address: &str) -> Result<(), MarketError> {
    let hex_part = address
        .strip_prefix("0x")
        .ok_or_else(|| MarketError::validation("Wallet address must start with 0x"))?;
    if hex_part.len() != 40 || hex::decode(hex_part).is_err() {
        return Err(MarketError::validation("Wallet address must be 20 hex bytes"));
    }
    Ok(())
}

/// Public view of a user; never exposes credentials or the wallet address.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub organization_name: String,
    pub organization_type: String,
    pub is_verified: bool,
    pub is_blocked: bool,
    pub has_wallet: bool,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            organization_name: user.organization_name.clone(),
            organization_type: user.organization_type.clone(),
            is_verified: user.is_verified,
            is_blocked: user.is_blocked,
            has_wallet: user.wallet_address.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_role() {
        let mut seller = User::new("seller1", "s@example.com", Role::Seller);
        assert!(seller.require_role(&[Role::Seller, Role::Admin]).is_ok());
        assert!(matches!(
            seller.require_role(&[Role::Buyer]),
            Err(MarketError::PermissionDenied(_))
        ));

        seller.is_blocked = true;
        assert!(seller.require_role(&[Role::Seller]).is_err());
    }

    #[test]
    fn test_wallet_validation() {
        assert!(validate_wallet_address("0x1234567890123456789012345678901234567890").is_ok());
        assert!(validate_wallet_address("1234567890123456789012345678901234567890").is_err());
        assert!(validate_wallet_address("0x12").is_err());
        assert!(validate_wallet_address("0xZZ34567890123456789012345678901234567890").is_err());
    }

    #[test]
    fn test_profile_hides_credentials() {
        let mut user = User::new("buyer1", "b@example.com", Role::Buyer);
        user.password_hash = "secret".into();
        let json = serde_json::to_string(&UserProfile::from(&user)).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"role\":\"buyer\""));
    }
}

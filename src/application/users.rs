use crate::domain::ports::{SessionStoreRef, UserStoreRef};
use crate::domain::user::{Role, User, UserId, validate_wallet_address};
use crate::error::{MarketError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Partial profile update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub organization_name: Option<String>,
    pub organization_type: Option<String>,
    pub wallet_address: Option<String>,
}

pub struct UserService {
    users: UserStoreRef,
    sessions: SessionStoreRef,
}

impl UserService {
    pub fn new(users: UserStoreRef, sessions: SessionStoreRef) -> Self {
        Self { users, sessions }
    }

    pub async fn get(&self, id: UserId) -> Result<User> {
        self.users
            .get(id)
            .await?
            .ok_or_else(|| MarketError::not_found(format!("User {id}")))
    }

    pub async fn update_profile(&self, user: &User, update: ProfileUpdate) -> Result<User> {
        let mut user = self.get(user.id).await?;
        if let Some(email) = update.email {
            if !email.contains('@') {
                return Err(MarketError::validation("A valid email is required"));
            }
            user.email = email.trim().to_string();
        }
        if let Some(name) = update.organization_name {
            user.organization_name = name;
        }
        if let Some(kind) = update.organization_type {
            user.organization_type = kind;
        }
        if let Some(wallet) = update.wallet_address {
            validate_wallet_address(&wallet)?;
            user.wallet_address = Some(wallet);
        }
        self.users.store(user.clone()).await?;
        Ok(user)
    }

    /// Blocks `target` and ends all of its sessions.
    pub async fn block(&self, admin: &User, target: UserId) -> Result<User> {
        admin.require_role(&[Role::Admin])?;
        if admin.id == target {
            return Err(MarketError::validation("Admins cannot block themselves"));
        }
        let mut user = self.get(target).await?;
        user.is_blocked = true;
        self.users.store(user.clone()).await?;
        let revoked = self.sessions.revoke_user(target).await?;
        info!(user = %target, admin = %admin.id, revoked, "user blocked");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Session, SessionStore, UserStore};
    use crate::infrastructure::in_memory::{InMemorySessionStore, InMemoryUserStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_block_revokes_sessions() {
        let users = Arc::new(InMemoryUserStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let service = UserService::new(users.clone(), sessions.clone());

        let admin = User::new("admin", "admin@example.com", Role::Admin);
        let seller = User::new("seller1", "seller1@example.com", Role::Seller);
        users.store(admin.clone()).await.unwrap();
        users.store(seller.clone()).await.unwrap();
        sessions
            .store(
                "tok",
                Session {
                    user: seller.id,
                    expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                },
            )
            .await
            .unwrap();

        let blocked = service.block(&admin, seller.id).await.unwrap();
        assert!(blocked.is_blocked);
        assert!(sessions.get("tok").await.unwrap().is_none());

        assert!(matches!(
            service.block(&seller, admin.id).await,
            Err(MarketError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_update_profile_validates_wallet() {
        let users = Arc::new(InMemoryUserStore::new());
        let service = UserService::new(users.clone(), Arc::new(InMemorySessionStore::new()));
        let buyer = User::new("buyer1", "buyer1@example.com", Role::Buyer);
        users.store(buyer.clone()).await.unwrap();

        let bad = ProfileUpdate {
            wallet_address: Some("not-a-wallet".into()),
            ..Default::default()
        };
        assert!(service.update_profile(&buyer, bad).await.is_err());

        let good = ProfileUpdate {
            organization_name: Some("Eco Solutions Ltd".into()),
            wallet_address: Some("0x3456789012345678901234567890123456789012".into()),
            ..Default::default()
        };
        let updated = service.update_profile(&buyer, good).await.unwrap();
        assert_eq!(updated.organization_name, "Eco Solutions Ltd");
        assert!(updated.wallet().is_ok());
    }
}

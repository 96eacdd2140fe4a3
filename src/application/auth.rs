use crate::config::AuthConfig;
use crate::domain::ports::{Session, SessionStoreRef, UserStoreRef};
use crate::domain::user::{Role, User, UserProfile, validate_wallet_address};
use crate::error::{MarketError, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub organization_type: String,
    #[serde(default)]
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginToken {
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub user: UserProfile,
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

/// Account registration and bearer-token sessions.
pub struct AuthService {
    users: UserStoreRef,
    sessions: SessionStoreRef,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(users: UserStoreRef, sessions: SessionStoreRef, config: AuthConfig) -> Self {
        Self {
            users,
            sessions,
            config,
        }
    }

    /// Self-service sign-up; admins are only created through seeding.
    pub async fn register(&self, registration: Registration) -> Result<User> {
        if registration.role == Role::Admin {
            return Err(MarketError::forbidden("Admin accounts cannot self-register"));
        }
        self.create_user(registration, false).await
    }

    /// Creates a user of any role. `verified` marks the organization as vetted.
    pub async fn create_user(&self, registration: Registration, verified: bool) -> Result<User> {
        let username = registration.username.trim();
        if username.is_empty() {
            return Err(MarketError::validation("Username is required"));
        }
        if !registration.email.contains('@') {
            return Err(MarketError::validation("A valid email is required"));
        }
        if registration.password.len() < self.config.min_password_len {
            return Err(MarketError::validation(format!(
                "Password must be at least {} characters",
                self.config.min_password_len
            )));
        }
        if let Some(wallet) = &registration.wallet_address {
            validate_wallet_address(wallet)?;
        }
        if self.users.find_by_username(username).await?.is_some() {
            return Err(MarketError::Conflict(format!(
                "Username {username} is already taken"
            )));
        }

        let mut user = User::new(username, registration.email.trim(), registration.role);
        user.organization_name = registration.organization_name;
        user.organization_type = registration.organization_type;
        user.wallet_address = registration.wallet_address;
        user.is_verified = verified;
        user.password_salt = random_hex(16);
        user.password_hash = hash_password(&user.password_salt, &registration.password);

        self.users.store(user.clone()).await?;
        info!(user = %user.id, role = ?user.role, "user registered");
        Ok(user)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginToken> {
        let invalid = || MarketError::Unauthorized("Invalid username or password".into());
        let user = self
            .users
            .find_by_username(username.trim())
            .await?
            .ok_or_else(invalid)?;
        if hash_password(&user.password_salt, password) != user.password_hash {
            warn!(username, "failed login attempt");
            return Err(invalid());
        }
        if user.is_blocked {
            return Err(MarketError::forbidden("User is blocked"));
        }

        self.start_session(&user).await
    }

    /// Issues a new token for `user`, dropping expired sessions on the way.
    async fn start_session(&self, user: &User) -> Result<LoginToken> {
        let now = Utc::now();
        let purged = self.sessions.purge_expired(now).await?;
        if purged > 0 {
            debug!(purged, "expired sessions removed");
        }
        let token = random_hex(32);
        let expires_at = now + Duration::seconds(self.config.session_ttl_secs as i64);
        self.sessions
            .store(
                &token,
                Session {
                    user: user.id,
                    expires_at,
                },
            )
            .await?;
        Ok(LoginToken {
            token,
            expires_at,
            user: UserProfile::from(user),
        })
    }

    /// Swaps a live token for a new one with a fresh expiry.
    pub async fn refresh(&self, token: &str) -> Result<LoginToken> {
        let user = self.authenticate(token).await?;
        let renewed = self.start_session(&user).await?;
        self.sessions.remove(token).await?;
        info!(user = %user.id, "session refreshed");
        Ok(renewed)
    }

    /// Resolves a bearer token to its (non-blocked) user.
    pub async fn authenticate(&self, token: &str) -> Result<User> {
        let unauthorized = || MarketError::Unauthorized("Invalid or expired token".into());
        let session = self.sessions.get(token).await?.ok_or_else(unauthorized)?;
        if session.expires_at <= Utc::now() {
            self.sessions.remove(token).await?;
            return Err(unauthorized());
        }
        let user = self
            .users
            .get(session.user)
            .await?
            .ok_or_else(unauthorized)?;
        if user.is_blocked {
            return Err(MarketError::forbidden("User is blocked"));
        }
        Ok(user)
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        self.sessions.remove(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SessionStore;
    use crate::infrastructure::in_memory::{InMemorySessionStore, InMemoryUserStore};
    use std::sync::Arc;

    fn service() -> AuthService {
        AuthService::new(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemorySessionStore::new()),
            AuthConfig::default(),
        )
    }

    fn registration(username: &str, role: Role) -> Registration {
        Registration {
            username: username.into(),
            email: format!("{username}@example.com"),
            password: "correct horse".into(),
            role,
            organization_name: String::new(),
            organization_type: String::new(),
            wallet_address: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let auth = service();
        let user = auth.register(registration("buyer1", Role::Buyer)).await.unwrap();
        assert_ne!(user.password_hash, "correct horse");

        let login = auth.login("buyer1", "correct horse").await.unwrap();
        assert_eq!(login.token.len(), 64);
        let resolved = auth.authenticate(&login.token).await.unwrap();
        assert_eq!(resolved.id, user.id);

        auth.logout(&login.token).await.unwrap();
        assert!(matches!(
            auth.authenticate(&login.token).await,
            Err(MarketError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let auth = service();
        auth.register(registration("seller1", Role::Seller)).await.unwrap();
        assert!(matches!(
            auth.login("seller1", "wrong password").await,
            Err(MarketError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rules() {
        let auth = service();
        assert!(matches!(
            auth.register(registration("root", Role::Admin)).await,
            Err(MarketError::PermissionDenied(_))
        ));

        let mut short = registration("shorty", Role::Buyer);
        short.password = "abc".into();
        assert!(matches!(
            auth.register(short).await,
            Err(MarketError::ValidationError(_))
        ));

        auth.register(registration("dup", Role::Buyer)).await.unwrap();
        assert!(matches!(
            auth.register(registration("dup", Role::Seller)).await,
            Err(MarketError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_session() {
        let auth = AuthService::new(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemorySessionStore::new()),
            AuthConfig {
                session_ttl_secs: 0,
                ..AuthConfig::default()
            },
        );
        auth.register(registration("buyer2", Role::Buyer)).await.unwrap();
        let login = auth.login("buyer2", "correct horse").await.unwrap();
        assert!(auth.authenticate(&login.token).await.is_err());
        assert!(auth.refresh(&login.token).await.is_err());
    }

    #[tokio::test]
    async fn test_login_purges_expired_sessions() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let auth = AuthService::new(
            Arc::new(InMemoryUserStore::new()),
            sessions.clone(),
            AuthConfig {
                session_ttl_secs: 0,
                ..AuthConfig::default()
            },
        );
        auth.register(registration("buyer3", Role::Buyer)).await.unwrap();
        let first = auth.login("buyer3", "correct horse").await.unwrap();
        let second = auth.login("buyer3", "correct horse").await.unwrap();

        assert!(sessions.get(&first.token).await.unwrap().is_none());
        assert!(sessions.get(&second.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let auth = service();
        let user = auth.register(registration("seller2", Role::Seller)).await.unwrap();
        let login = auth.login("seller2", "correct horse").await.unwrap();

        let refreshed = auth.refresh(&login.token).await.unwrap();
        assert_ne!(refreshed.token, login.token);
        assert!(refreshed.expires_at >= login.expires_at);
        assert_eq!(auth.authenticate(&refreshed.token).await.unwrap().id, user.id);
        assert!(matches!(
            auth.authenticate(&login.token).await,
            Err(MarketError::Unauthorized(_))
        ));
    }
}

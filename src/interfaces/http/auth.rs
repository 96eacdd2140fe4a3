use super::AppState;
use crate::domain::user::User;
use crate::error::MarketError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

/// The caller behind a `Authorization: Bearer <token>` header.
///
/// `Token <token>` is accepted as well.
pub struct AuthUser {
    pub user: User,
    pub token: String,
}

fn bearer_token(parts: &Parts) -> Result<&str, MarketError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or_else(|| MarketError::Unauthorized("Missing authorization header".into()))?
        .to_str()
        .map_err(|_| MarketError::Unauthorized("Malformed authorization header".into()))?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("Token "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| MarketError::Unauthorized("Expected a bearer token".into()))
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = MarketError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?.to_string();
        let user = state.market.auth.authenticate(&token).await?;
        Ok(Self { user, token })
    }
}

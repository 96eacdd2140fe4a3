//! JSON-over-HTTP API.
//!
//! Errors are rendered as `{"error": <category>, "detail": <message>}` with
//! the status code from [`MarketError::status_code`](crate::error::MarketError::status_code).

pub mod auth;
pub mod error;
pub mod handlers;

use crate::application::Marketplace;
use crate::config::MarketConfig;
use crate::error::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub market: Arc<Marketplace>,
    max_body_bytes: usize,
}

impl AppState {
    pub fn new(market: Arc<Marketplace>, config: &MarketConfig) -> Self {
        // base64 inflates uploads by a third, plus room for the JSON envelope
        let max_body_bytes = (config.documents.max_upload_bytes as usize / 3 + 1) * 4 + 64 * 1024;
        Self {
            market,
            max_body_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/register", post(handlers::register))
        .route("/api/login", post(handlers::login))
        .route("/api/logout", post(handlers::logout))
        .route("/api/token/refresh", post(handlers::refresh_token))
        .route(
            "/api/profile",
            get(handlers::profile).patch(handlers::update_profile),
        )
        .route("/api/admin/block-user/:id", post(handlers::block_user))
        .route(
            "/api/credits",
            get(handlers::list_credits).post(handlers::issue_credit),
        )
        .route("/api/credits/:id", get(handlers::get_credit))
        .route("/api/credits/:id/retire", post(handlers::retire_credit))
        .route("/api/listings", get(handlers::listings))
        .route("/api/admin/verify-credit/:id", post(handlers::verify_credit))
        .route("/api/purchase", post(handlers::purchase))
        .route("/api/transactions", get(handlers::list_transactions))
        .route("/api/transactions/:id", get(handlers::get_transaction))
        .route("/api/documents", get(handlers::list_documents))
        .route("/api/documents/upload", post(handlers::upload_document))
        .route(
            "/api/documents/:id/download",
            get(handlers::download_document),
        )
        .route("/api/documents/:id/review", post(handlers::review_document))
        .route("/api/payments/fiat", post(handlers::fiat_payment))
        .route("/api/payments/crypto", post(handlers::crypto_payment))
        .route("/api/payments/webhook", post(handlers::payment_webhook))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves the API on `config.server.bind` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, config: &MarketConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

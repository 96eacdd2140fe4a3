use super::AppState;
use super::auth::AuthUser;
use crate::application::auth::{LoginToken, Registration};
use crate::application::credits::{Page, VerifyAction};
use crate::application::documents::{ReviewAction, Upload};
use crate::application::payments::{CryptoPaymentOutcome, FiatPaymentIntent, WebhookOutcome};
use crate::application::settlement::PurchaseRequest;
use crate::application::users::ProfileUpdate;
use crate::domain::credit::{CarbonCredit, CreditId, NewCredit};
use crate::domain::document::{Document, DocumentId};
use crate::domain::money::Quantity;
use crate::domain::transaction::{Transaction, TransactionId};
use crate::domain::user::{UserId, UserProfile};
use crate::error::MarketError;
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

type ApiResult<T> = Result<T, MarketError>;

/// JSON body whose rejections use the API error format.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(MarketError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(MarketError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(MarketError))]
pub struct ApiQuery<T>(pub T);

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn register(
    State(state): State<AppState>,
    ApiJson(registration): ApiJson<Registration>,
) -> ApiResult<(StatusCode, Json<UserProfile>)> {
    let user = state.market.auth.register(registration).await?;
    Ok((StatusCode::CREATED, Json(UserProfile::from(&user))))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> ApiResult<Json<LoginToken>> {
    let token = state
        .market
        .auth
        .login(&request.username, &request.password)
        .await?;
    Ok(Json(token))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<LoginToken>> {
    Ok(Json(state.market.auth.refresh(&auth.token).await?))
}

pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> ApiResult<StatusCode> {
    state.market.auth.logout(&auth.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn profile(auth: AuthUser) -> Json<UserProfile> {
    Json(UserProfile::from(&auth.user))
}

pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(update): ApiJson<ProfileUpdate>,
) -> ApiResult<Json<UserProfile>> {
    let user = state.market.users.update_profile(&auth.user, update).await?;
    Ok(Json(UserProfile::from(&user)))
}

pub async fn block_user(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<UserId>,
) -> ApiResult<Json<UserProfile>> {
    let user = state.market.users.block(&auth.user, id).await?;
    Ok(Json(UserProfile::from(&user)))
}

pub async fn list_credits(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<CarbonCredit>>> {
    Ok(Json(state.market.credits.list(&auth.user).await?))
}

pub async fn issue_credit(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(new): ApiJson<NewCredit>,
) -> ApiResult<(StatusCode, Json<CarbonCredit>)> {
    let credit = state.market.credits.issue(&auth.user, new).await?;
    Ok((StatusCode::CREATED, Json(credit)))
}

pub async fn get_credit(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<CreditId>,
) -> ApiResult<Json<CarbonCredit>> {
    Ok(Json(state.market.credits.get(&auth.user, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RetireBody {
    pub quantity: Quantity,
}

pub async fn retire_credit(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<CreditId>,
    ApiJson(body): ApiJson<RetireBody>,
) -> ApiResult<Json<CarbonCredit>> {
    let credit = state
        .market
        .credits
        .retire(&auth.user, id, body.quantity)
        .await?;
    Ok(Json(credit))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

pub async fn listings(
    State(state): State<AppState>,
    _auth: AuthUser,
    ApiQuery(params): ApiQuery<PageParams>,
) -> ApiResult<Json<Page<CarbonCredit>>> {
    let page = state
        .market
        .credits
        .listings(params.page.unwrap_or(1), params.page_size.unwrap_or(20))
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub action: VerifyAction,
}

pub async fn verify_credit(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<CreditId>,
    ApiJson(body): ApiJson<VerifyBody>,
) -> ApiResult<Json<CarbonCredit>> {
    let credit = state
        .market
        .credits
        .verify(&auth.user, id, body.action)
        .await?;
    Ok(Json(credit))
}

pub async fn purchase(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    ApiJson(request): ApiJson<PurchaseRequest>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| MarketError::validation("Malformed Idempotency-Key header"))
        })
        .transpose()?;
    let tx = state
        .market
        .settlement
        .purchase(&auth.user, request, key)
        .await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<Transaction>>> {
    Ok(Json(
        state.market.settlement.list_transactions(&auth.user).await?,
    ))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<TransactionId>,
) -> ApiResult<Json<Transaction>> {
    Ok(Json(state.market.settlement.get(&auth.user, id).await?))
}

pub async fn list_documents(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<Document>>> {
    Ok(Json(state.market.documents.list(&auth.user).await?))
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub carbon_credit: CreditId,
    pub file_name: String,
    pub content_type: String,
    /// Base64-encoded file content.
    pub content: String,
}

pub async fn upload_document(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(body): ApiJson<UploadBody>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let content = BASE64
        .decode(body.content.trim())
        .map_err(|e| MarketError::validation(format!("Content is not valid base64: {e}")))?;
    let upload = Upload {
        carbon_credit: body.carbon_credit,
        file_name: body.file_name,
        content_type: body.content_type,
        content,
    };
    let document = state.market.documents.upload(&auth.user, upload).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

#[derive(Debug, Serialize)]
pub struct DownloadLink {
    pub url: String,
}

pub async fn download_document(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<DocumentId>,
) -> ApiResult<Json<DownloadLink>> {
    let url = state.market.documents.download_url(&auth.user, id).await?;
    Ok(Json(DownloadLink { url }))
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub action: ReviewAction,
    #[serde(default)]
    pub comments: String,
}

pub async fn review_document(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<DocumentId>,
    ApiJson(body): ApiJson<ReviewBody>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let document = state
        .market
        .documents
        .review(&auth.user, id, body.action, &body.comments)
        .await?;
    let status = match body.action {
        ReviewAction::Approve => StatusCode::ACCEPTED,
        ReviewAction::Reject => StatusCode::OK,
    };
    Ok((status, Json(document)))
}

#[derive(Debug, Deserialize)]
pub struct FiatPaymentBody {
    pub transaction_id: TransactionId,
}

pub async fn fiat_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(body): ApiJson<FiatPaymentBody>,
) -> ApiResult<Json<FiatPaymentIntent>> {
    let intent = state
        .market
        .payments
        .create_fiat_payment(&auth.user, body.transaction_id)
        .await?;
    Ok(Json(intent))
}

#[derive(Debug, Deserialize)]
pub struct CryptoPaymentBody {
    pub transaction_id: TransactionId,
    pub tx_hash: String,
}

pub async fn crypto_payment(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(body): ApiJson<CryptoPaymentBody>,
) -> ApiResult<Response> {
    let outcome: CryptoPaymentOutcome = state
        .market
        .payments
        .process_crypto_payment(&auth.user, body.transaction_id, &body.tx_hash)
        .await?;
    let status = if outcome.verified {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(outcome)).into_response())
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MarketError::SecurityError("Missing webhook signature".into()))?;
    let outcome = state
        .market
        .payments
        .handle_webhook(&body, signature)
        .await?;
    let body = match outcome {
        WebhookOutcome::Completed(receipt) => json!({
            "status": "completed",
            "receipt_number": receipt.receipt_number,
            "document_url": receipt.document_url,
        }),
        WebhookOutcome::Failed(payment) => json!({ "status": "failed", "payment_id": payment }),
        WebhookOutcome::Ignored(event) => json!({ "status": "ignored", "event": event }),
    };
    Ok(Json(body))
}
